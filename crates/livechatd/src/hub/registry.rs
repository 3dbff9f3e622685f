//! Connection registry: the authoritative table of live connections.
//!
//! Owned by the hub actor, so every caller is serialized through its command
//! channel and no lock is needed here.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use livechat_core::{ConnectionId, Role, SessionId};
use livechat_protocol::ServerMessage;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::commands::{ConnectionInfo, HubError, NewConnection};
use crate::outbound::{OutboundQueue, PushOutcome};

/// One registered connection.
#[derive(Debug)]
pub struct ConnectionEntry {
    pub id: ConnectionId,
    pub role: Role,
    pub display_name: Option<String>,
    outbound: Arc<OutboundQueue>,
    close: CancellationToken,
    registered_at: DateTime<Utc>,
    last_activity: Instant,
}

impl ConnectionEntry {
    pub fn new(connection: NewConnection, at: Instant) -> Self {
        Self {
            id: connection.id,
            role: connection.role,
            display_name: connection.display_name,
            outbound: connection.outbound,
            close: connection.close,
            registered_at: Utc::now(),
            last_activity: at,
        }
    }

    /// Queues a frame without blocking.
    pub fn send(&self, frame: ServerMessage) -> PushOutcome {
        self.outbound.push(frame)
    }

    /// Closes the outbound queue and cancels the connection's tasks.
    /// Frames already queued are still written.
    pub fn shutdown(&self) {
        self.outbound.close();
        self.close.cancel();
    }

    pub fn touch(&mut self, at: Instant) {
        if at > self.last_activity {
            self.last_activity = at;
        }
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn overflow_count(&self) -> u64 {
        self.outbound.overflow_count()
    }

    pub fn info(&self, sessions: Vec<SessionId>, now: Instant) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.clone(),
            role: self.role,
            display_name: self.display_name.clone(),
            sessions,
            registered_at: self.registered_at,
            idle_secs: now.saturating_duration_since(self.last_activity).as_secs(),
            queued: self.outbound.len(),
            overflowed: self.outbound.overflow_count(),
        }
    }
}

#[derive(Debug)]
pub struct ConnectionRegistry {
    entries: HashMap<ConnectionId, ConnectionEntry>,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_connections,
        }
    }

    /// Inserts an entry.
    ///
    /// # Errors
    /// - `HubError::DuplicateIdentity` if the id is already live
    /// - `HubError::HubFull` at capacity
    pub fn register(&mut self, entry: ConnectionEntry) -> Result<(), HubError> {
        if self.entries.contains_key(&entry.id) {
            return Err(HubError::DuplicateIdentity(entry.id));
        }
        if self.entries.len() >= self.max_connections {
            return Err(HubError::HubFull {
                max: self.max_connections,
            });
        }
        self.entries.insert(entry.id.clone(), entry);
        Ok(())
    }

    /// Removes an entry; `None` for unknown ids.
    pub fn unregister(&mut self, id: &ConnectionId) -> Option<ConnectionEntry> {
        self.entries.remove(id)
    }

    pub fn lookup(&self, id: &ConnectionId) -> Option<&ConnectionEntry> {
        self.entries.get(id)
    }

    pub fn lookup_mut(&mut self, id: &ConnectionId) -> Option<&mut ConnectionEntry> {
        self.entries.get_mut(id)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.entries.contains_key(id)
    }

    /// Ids with the given role, sorted for stable output.
    pub fn list_by_role(&self, role: Role) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .entries
            .values()
            .filter(|e| e.role == role)
            .map(|e| e.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn count_by_role(&self, role: Role) -> usize {
        self.entries.values().filter(|e| e.role == role).count()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn overflow_total(&self) -> u64 {
        self.entries.values().map(ConnectionEntry::overflow_count).sum()
    }
}
