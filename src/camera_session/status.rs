//! Camera Status Tracker
//!
//! Tracks one session's connection status. A single failed request never
//! takes the camera offline; three in a row do. One success restores it.
//! Only transitions are reported.

use serde::Serialize;

/// Consecutive liveness failures before a camera is declared offline
pub const OFFLINE_AFTER_FAILURES: u32 = 3;

/// Why a camera is offline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfflineReason {
    /// Unreachable, timed out, reset
    CommunicationError,
    /// Auth failure or bad configuration; holds until reconfigured
    ConfigurationError,
    /// Session stopped
    Gone,
}

/// Externally visible session status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Connecting,
    Online,
    Offline { reason: OfflineReason, detail: String },
}

impl SessionStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, SessionStatus::Online)
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, SessionStatus::Offline { .. })
    }
}

/// Liveness bookkeeping for one camera
#[derive(Debug, Clone)]
pub struct LivenessTracker {
    status: SessionStatus,
    consecutive_failures: u32,
}

impl Default for LivenessTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessTracker {
    pub fn new() -> Self {
        Self {
            status: SessionStatus::Connecting,
            consecutive_failures: 0,
        }
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// A request got an answer. Returns the new status on a transition.
    pub fn record_success(&mut self) -> Option<SessionStatus> {
        self.consecutive_failures = 0;
        if matches!(
            self.status,
            SessionStatus::Offline {
                reason: OfflineReason::ConfigurationError | OfflineReason::Gone,
                ..
            }
        ) {
            return None;
        }
        self.transition(SessionStatus::Online)
    }

    /// A request failed on the network
    pub fn record_failure(&mut self, detail: impl Into<String>) -> Option<SessionStatus> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures < OFFLINE_AFTER_FAILURES || self.status.is_offline() {
            return None;
        }
        self.transition(SessionStatus::Offline {
            reason: OfflineReason::CommunicationError,
            detail: detail.into(),
        })
    }

    /// Auth or configuration problem: offline immediately, until `reset`
    pub fn configuration_error(&mut self, detail: impl Into<String>) -> Option<SessionStatus> {
        self.transition(SessionStatus::Offline {
            reason: OfflineReason::ConfigurationError,
            detail: detail.into(),
        })
    }

    /// Health tick on an offline camera starts a reconnect attempt
    pub fn reconnecting(&mut self) -> Option<SessionStatus> {
        match self.status {
            SessionStatus::Offline {
                reason: OfflineReason::CommunicationError,
                ..
            } => self.transition(SessionStatus::Connecting),
            _ => None,
        }
    }

    pub fn stopped(&mut self) -> Option<SessionStatus> {
        self.transition(SessionStatus::Offline {
            reason: OfflineReason::Gone,
            detail: "session stopped".to_string(),
        })
    }

    /// Start over (new configuration)
    pub fn reset(&mut self) -> Option<SessionStatus> {
        self.consecutive_failures = 0;
        self.transition(SessionStatus::Connecting)
    }

    fn transition(&mut self, next: SessionStatus) -> Option<SessionStatus> {
        if self.status == next {
            return None;
        }
        match (&self.status, &next) {
            (SessionStatus::Online, SessionStatus::Offline { detail, .. }) => {
                tracing::warn!(detail = %detail, "Camera connection lost");
            }
            (SessionStatus::Offline { .. }, SessionStatus::Online) => {
                tracing::info!("Camera connection recovered");
            }
            _ => {}
        }
        self.status = next.clone();
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_failures_go_offline() {
        let mut t = LivenessTracker::new();
        assert_eq!(t.record_success(), Some(SessionStatus::Online));

        assert_eq!(t.record_failure("timeout"), None);
        assert_eq!(t.record_failure("timeout"), None);
        let next = t.record_failure("timeout").unwrap();
        assert!(matches!(
            next,
            SessionStatus::Offline { reason: OfflineReason::CommunicationError, .. }
        ));

        // Further failures do not re-report
        assert_eq!(t.record_failure("timeout"), None);
    }

    #[test]
    fn test_single_success_restores() {
        let mut t = LivenessTracker::new();
        for _ in 0..3 {
            t.record_failure("refused");
        }
        assert!(t.status().is_offline());
        assert_eq!(t.reconnecting(), Some(SessionStatus::Connecting));
        assert_eq!(t.record_success(), Some(SessionStatus::Online));
    }

    #[test]
    fn test_intermittent_failure_stays_online() {
        let mut t = LivenessTracker::new();
        t.record_success();
        for _ in 0..5 {
            assert_eq!(t.record_failure("lost packet"), None);
            assert_eq!(t.record_failure("lost packet"), None);
            assert_eq!(t.record_success(), None);
        }
        assert!(t.status().is_online());
    }

    #[test]
    fn test_configuration_error_holds_until_reset() {
        let mut t = LivenessTracker::new();
        t.configuration_error("digest downgrade refused");
        assert_eq!(t.record_success(), None);
        assert_eq!(t.reconnecting(), None);
        assert_eq!(t.reset(), Some(SessionStatus::Connecting));
        assert_eq!(t.record_success(), Some(SessionStatus::Online));
    }
}
