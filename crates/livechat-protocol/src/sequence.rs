//! Client-side check that per-session sequence numbers arrive in order.

use std::collections::HashMap;

use livechat_core::{Envelope, SessionId};

/// Outcome of observing one sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// Exactly the next number
    InOrder,
    /// Numbers were skipped (e.g. dropped from a full queue)
    Gap { expected: u64, got: u64 },
    /// Not greater than the last one seen
    Stale { last: u64, got: u64 },
}

/// Tracks the last sequence number seen per session.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: HashMap<SessionId, u64>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `seq` for `session_id`. Stale numbers do not move the cursor.
    pub fn observe(&mut self, session_id: &SessionId, seq: u64) -> SequenceCheck {
        let last = self.last.get(session_id).copied().unwrap_or(0);
        if seq <= last {
            return SequenceCheck::Stale { last, got: seq };
        }
        self.last.insert(session_id.clone(), seq);
        let expected = last.saturating_add(1);
        if seq == expected {
            SequenceCheck::InOrder
        } else {
            SequenceCheck::Gap { expected, got: seq }
        }
    }

    pub fn observe_envelope(&mut self, envelope: &Envelope) -> SequenceCheck {
        self.observe(&envelope.session_id, envelope.seq)
    }

    pub fn last_seen(&self, session_id: &SessionId) -> Option<u64> {
        self.last.get(session_id).copied()
    }

    /// Forgets a closed session.
    pub fn forget(&mut self, session_id: &SessionId) {
        self.last.remove(session_id);
    }
}
