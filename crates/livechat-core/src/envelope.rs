//! The routed unit of a chat message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ConnectionId, Role, SessionId};

/// A chat message plus its routing metadata.
///
/// `seq` is assigned by the hub when the message is accepted and is strictly
/// increasing within `session_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub session_id: SessionId,
    pub seq: u64,
    pub sender: ConnectionId,
    pub sender_role: Role,
    pub payload: String,
    /// Server acceptance time
    pub sent_at: DateTime<Utc>,
    /// Timestamp the client stamped on the frame (ms since epoch), untrusted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_timestamp: Option<i64>,
}

impl Envelope {
    /// Short payload excerpt for agent notifications and logs.
    pub fn preview(&self, max_chars: usize) -> String {
        let mut chars = self.payload.chars();
        let head: String = chars.by_ref().take(max_chars).collect();
        if chars.next().is_some() {
            format!("{head}…")
        } else {
            head
        }
    }
}
