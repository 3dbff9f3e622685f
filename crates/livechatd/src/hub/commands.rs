//! Hub actor commands, errors, and events.
//!
//! - `HubCommand`: requests sent to the actor, each with a oneshot reply
//! - `HubError`: failures the actor reports back
//! - `HubEvent`: lifecycle notifications broadcast to observers
//!
//! Every mutating command carries the `Instant` it was issued at, so
//! activity timestamps reflect when the frame arrived rather than when the
//! actor got around to it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use livechat_core::{CloseReason, ConnectionId, Role, SessionId, SessionView};
use livechat_protocol::codes;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::outbound::OutboundQueue;

// ============================================================================
// Command Payloads
// ============================================================================

/// A connection asking to join the hub.
#[derive(Debug)]
pub struct NewConnection {
    pub id: ConnectionId,
    pub role: Role,
    pub display_name: Option<String>,
    /// Frames for this connection are pushed here
    pub outbound: Arc<OutboundQueue>,
    /// Cancelled when the hub forces the connection closed
    pub close: CancellationToken,
}

/// Successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registered {
    pub id: ConnectionId,
    /// The visitor's freshly opened session
    pub session_id: Option<SessionId>,
}

/// Snapshot of one registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub role: Role,
    pub display_name: Option<String>,
    pub sessions: Vec<SessionId>,
    pub registered_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub queued: usize,
    pub overflowed: u64,
}

/// Inbound chat text, as handed over by a connection supervisor.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub sender: ConnectionId,
    pub session_id: Option<SessionId>,
    pub payload: String,
    pub client_timestamp: Option<i64>,
    pub at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Pushed to the counterpart's outbound queue
    Delivered { session_id: SessionId, seq: u64 },
    /// Held until an agent claims the session
    Held { session_id: SessionId, seq: u64 },
}

impl RouteOutcome {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Delivered { session_id, .. } | Self::Held { session_id, .. } => session_id,
        }
    }

    pub fn seq(&self) -> u64 {
        match self {
            Self::Delivered { seq, .. } | Self::Held { seq, .. } => *seq,
        }
    }
}

/// A session the reaper may expire, with the activity it observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleCandidate {
    pub session_id: SessionId,
    pub last_activity: Instant,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub visitors: usize,
    pub agents: usize,
    pub waiting_sessions: usize,
    pub active_sessions: usize,
    pub messages_routed: u64,
    pub sessions_closed: u64,
    pub outbound_overflows: u64,
}

// ============================================================================
// Hub Commands
// ============================================================================

#[derive(Debug)]
pub enum HubCommand {
    /// Register a connection. Visitors get a session opened.
    Register {
        connection: NewConnection,
        at: Instant,
        respond_to: oneshot::Sender<Result<Registered, HubError>>,
    },

    /// Remove a connection and close its sessions. Unknown ids are a no-op.
    Unregister {
        id: ConnectionId,
        at: Instant,
        respond_to: oneshot::Sender<bool>,
    },

    Lookup {
        id: ConnectionId,
        at: Instant,
        respond_to: oneshot::Sender<Option<ConnectionInfo>>,
    },

    ListByRole {
        role: Role,
        respond_to: oneshot::Sender<Vec<ConnectionId>>,
    },

    Route {
        request: RouteRequest,
        respond_to: oneshot::Sender<Result<RouteOutcome, HubError>>,
    },

    /// Compare-and-set the session's agent
    Claim {
        agent: ConnectionId,
        session_id: SessionId,
        at: Instant,
        respond_to: oneshot::Sender<Result<(), HubError>>,
    },

    CloseSession {
        requester: ConnectionId,
        session_id: Option<SessionId>,
        at: Instant,
        respond_to: oneshot::Sender<Result<SessionId, HubError>>,
    },

    /// Record activity on a connection (fire-and-forget)
    Touch { id: ConnectionId, at: Instant },

    WaitingSessions {
        at: Instant,
        respond_to: oneshot::Sender<Vec<SessionView>>,
    },

    GetSession {
        session_id: SessionId,
        at: Instant,
        respond_to: oneshot::Sender<Option<SessionView>>,
    },

    /// Point-in-time snapshot of sessions idle longer than `idle_timeout`
    IdleSessions {
        now: Instant,
        idle_timeout: Duration,
        respond_to: oneshot::Sender<Vec<IdleCandidate>>,
    },

    /// Close a session if it is still exactly as idle as when observed
    ExpireSession {
        candidate: IdleCandidate,
        idle_timeout: Duration,
        now: Instant,
        respond_to: oneshot::Sender<bool>,
    },

    Stats {
        respond_to: oneshot::Sender<HubStats>,
    },

    /// Close every session and connection
    Shutdown {
        at: Instant,
        respond_to: oneshot::Sender<usize>,
    },
}

// ============================================================================
// Hub Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("connection id already registered: {0}")]
    DuplicateIdentity(ConnectionId),

    #[error("hub is full (max: {max} connections)")]
    HubFull { max: usize },

    #[error("connection not registered: {0}")]
    NotRegistered(ConnectionId),

    #[error("{id} is not allowed to do that as {role}")]
    WrongRole { id: ConnectionId, role: Role },

    #[error("no open session {}", .session_id.as_ref().map_or("for sender", SessionId::as_str))]
    RecipientNotFound { session_id: Option<SessionId> },

    #[error("session_id is required")]
    SessionRequired,

    #[error("session {session_id} is not assigned to {agent}")]
    NotAssigned {
        session_id: SessionId,
        agent: ConnectionId,
    },

    #[error("session {session_id} references unregistered connection {missing}")]
    RegistryInconsistency {
        session_id: SessionId,
        missing: ConnectionId,
    },

    #[error("claim on {session_id} rejected: {reason}")]
    ClaimRejected { session_id: SessionId, reason: String },

    #[error("hub channel closed")]
    ChannelClosed,
}

impl HubError {
    /// Wire code reported to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateIdentity(_) => "duplicate_identity",
            Self::HubFull { .. } => "hub_full",
            Self::NotRegistered(_) | Self::ChannelClosed => codes::INTERNAL,
            Self::WrongRole { .. } => "wrong_role",
            Self::RecipientNotFound { .. } | Self::SessionRequired => codes::RECIPIENT_NOT_FOUND,
            Self::NotAssigned { .. } => codes::NOT_ASSIGNED,
            Self::RegistryInconsistency { .. } => codes::REGISTRY_INCONSISTENCY,
            Self::ClaimRejected { .. } => "claim_rejected",
        }
    }

    /// The session the error is about, if any.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::RecipientNotFound { session_id } => session_id.as_ref(),
            Self::NotAssigned { session_id, .. }
            | Self::RegistryInconsistency { session_id, .. }
            | Self::ClaimRejected { session_id, .. } => Some(session_id),
            _ => None,
        }
    }
}

// ============================================================================
// Hub Events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    ConnectionRegistered { id: ConnectionId, role: Role },
    ConnectionUnregistered { id: ConnectionId, role: Role },
    SessionOpened { session_id: SessionId, visitor: ConnectionId },
    AgentAssigned { session_id: SessionId, agent: ConnectionId },
    SessionClosed { session_id: SessionId, reason: CloseReason },
}
