//! ReplyStore - outstanding request paths and their latest raw replies
//!
//! Paths are kept in first-seen order with one reply slot each, so the
//! request list and the reply list always have the same length. A path is
//! recorded once; later requests for it reuse the slot.
//!
//! Every operation runs under one lock per camera session. Replies are
//! last-writer-wins by arrival time.

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone)]
struct Slot {
    path: String,
    reply: Option<String>,
    in_flight: bool,
    replied_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Diagnostic view of one slot
#[derive(Debug, Clone, Serialize)]
pub struct ReplySnapshot {
    pub path: String,
    pub reply: Option<String>,
    pub in_flight: bool,
    pub replied_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Request/reply correlation for one camera
#[derive(Debug, Default)]
pub struct ReplyStore {
    slots: Mutex<Vec<Slot>>,
}

impl ReplyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `path` if it is not already recorded
    pub fn record_request(&self, path: &str) {
        let mut slots = self.slots.lock();
        if Self::slot_index(&slots, path).is_none() {
            Self::push_slot(&mut slots, path);
        }
    }

    /// Mark `path` in flight. Returns false when a request for it is
    /// already outstanding, in which case the caller must not send another.
    pub fn begin_request(&self, path: &str) -> bool {
        let mut slots = self.slots.lock();
        let idx = Self::slot_index(&slots, path).unwrap_or_else(|| Self::push_slot(&mut slots, path));
        let slot = &mut slots[idx];
        if slot.in_flight {
            return false;
        }
        slot.in_flight = true;
        true
    }

    /// Request for `path` ended without a reply (error, timeout)
    pub fn abandon(&self, path: &str) {
        let mut slots = self.slots.lock();
        if let Some(idx) = Self::slot_index(&slots, path) {
            slots[idx].in_flight = false;
        }
    }

    /// Overwrite the reply slot for `path`, recording the path if needed
    pub fn store_reply(&self, path: &str, body: impl Into<String>) {
        let mut slots = self.slots.lock();
        let idx = Self::slot_index(&slots, path).unwrap_or_else(|| Self::push_slot(&mut slots, path));
        let slot = &mut slots[idx];
        slot.reply = Some(body.into());
        slot.in_flight = false;
        slot.replied_at = Some(chrono::Utc::now());
    }

    /// Most recent raw body for `path`
    pub fn lookup_reply(&self, path: &str) -> Option<String> {
        let slots = self.slots.lock();
        Self::slot_index(&slots, path).and_then(|idx| slots[idx].reply.clone())
    }

    pub fn is_in_flight(&self, path: &str) -> bool {
        let slots = self.slots.lock();
        Self::slot_index(&slots, path)
            .map(|idx| slots[idx].in_flight)
            .unwrap_or(false)
    }

    /// Request paths and replies, index-correlated, taken under one lock
    pub fn requests_and_replies(&self) -> (Vec<String>, Vec<Option<String>>) {
        let slots = self.slots.lock();
        slots
            .iter()
            .map(|s| (s.path.clone(), s.reply.clone()))
            .unzip()
    }

    pub fn snapshot(&self) -> Vec<ReplySnapshot> {
        self.slots
            .lock()
            .iter()
            .map(|s| ReplySnapshot {
                path: s.path.clone(),
                reply: s.reply.clone(),
                in_flight: s.in_flight,
                replied_at: s.replied_at,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Drop everything (reconfiguration)
    pub fn clear(&self) {
        self.slots.lock().clear();
    }

    fn slot_index(slots: &[Slot], path: &str) -> Option<usize> {
        slots.iter().position(|s| s.path == path)
    }

    fn push_slot(slots: &mut Vec<Slot>, path: &str) -> usize {
        slots.push(Slot {
            path: path.to_string(),
            reply: None,
            in_flight: false,
            replied_at: None,
        });
        slots.len() - 1
    }
}
