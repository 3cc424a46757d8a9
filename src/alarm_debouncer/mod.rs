//! AlarmDebouncer - held alarm state per canonical channel
//!
//! Each channel is one small state machine:
//!
//! - `Idle`: channel reported OFF
//! - `Active`: raised by a vendor that sends explicit stop tokens; held until `clear()`
//! - `CountingDown(n)`: raised by a polled vendor without a reliable stop;
//!   every scheduler tick decrements `n` and the tick that sees `n == 1`
//!   returns the channel to `Idle`
//!
//! Entering `Active`/`CountingDown` from `Idle` is reported as `Raised`
//! (the first occurrence, which triggers a snapshot refresh); re-arming an
//! already raised channel is `Refreshed`.

use std::collections::HashMap;

use crate::vendor_adapter::Channel;

/// Poll cycles a countdown-held alarm survives without fresh evidence
pub const DEFAULT_COUNTDOWN: u8 = 3;

/// Per-channel alarm state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmState {
    Idle,
    Active,
    CountingDown(u8),
}

/// Outcome of raising a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Raise {
    /// Channel was idle; it now reports ON
    Raised,
    /// Channel was already ON; only the hold was renewed
    Refreshed,
}

/// Countdown holder for one camera
#[derive(Debug, Clone)]
pub struct AlarmDebouncer {
    countdown: u8,
    channels: HashMap<Channel, AlarmState>,
}

impl Default for AlarmDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_COUNTDOWN)
    }
}

impl AlarmDebouncer {
    pub fn new(countdown: u8) -> Self {
        Self {
            countdown: countdown.max(1),
            channels: HashMap::new(),
        }
    }

    pub fn countdown(&self) -> u8 {
        self.countdown
    }

    pub fn state(&self, channel: Channel) -> AlarmState {
        self.channels
            .get(&channel)
            .copied()
            .unwrap_or(AlarmState::Idle)
    }

    /// Raise a polled channel and (re)arm its countdown
    pub fn trigger(&mut self, channel: Channel) -> Raise {
        let countdown = self.countdown;
        self.set(channel, AlarmState::CountingDown(countdown))
    }

    /// Raise a channel that stays ON until `clear()`
    pub fn latch(&mut self, channel: Channel) -> Raise {
        self.set(channel, AlarmState::Active)
    }

    /// Explicit stop. Returns true if the channel was raised.
    pub fn clear(&mut self, channel: Channel) -> bool {
        match self.channels.insert(channel, AlarmState::Idle) {
            Some(AlarmState::Idle) | None => false,
            Some(_) => true,
        }
    }

    /// One scheduler tick. Returns the channels that fell back to OFF.
    pub fn tick(&mut self) -> Vec<Channel> {
        let mut expired = Vec::new();
        for (channel, state) in self.channels.iter_mut() {
            if let AlarmState::CountingDown(n) = *state {
                if n > 1 {
                    *state = AlarmState::CountingDown(n - 1);
                } else {
                    *state = AlarmState::Idle;
                    expired.push(*channel);
                }
            }
        }
        expired.sort();
        expired
    }

    /// Drop every held alarm (camera lost). Returns the channels that were raised.
    pub fn release_all(&mut self) -> Vec<Channel> {
        let mut released: Vec<Channel> = self
            .channels
            .drain()
            .filter(|(_, state)| *state != AlarmState::Idle)
            .map(|(channel, _)| channel)
            .collect();
        released.sort();
        released
    }

    /// Ticks left before `channel` auto-clears (0 when not counting down)
    pub fn remaining(&self, channel: Channel) -> u8 {
        match self.state(channel) {
            AlarmState::CountingDown(n) => n,
            _ => 0,
        }
    }

    fn set(&mut self, channel: Channel, state: AlarmState) -> Raise {
        match self.channels.insert(channel, state) {
            Some(AlarmState::Idle) | None => Raise::Raised,
            Some(_) => Raise::Refreshed,
        }
    }
}
