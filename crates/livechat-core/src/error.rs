//! Domain-specific error types following panic-free policy.

use crate::{ConnectionId, SessionId};
use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Session already has an agent (lost claim race)
    #[error("Session {session_id} already assigned to {agent}")]
    AlreadyAssigned {
        session_id: SessionId,
        agent: ConnectionId,
    },

    /// Operation on a session that already reached `Closed`
    #[error("Session {session_id} is closed")]
    SessionClosed { session_id: SessionId },

    /// Client-supplied identity failed validation
    #[error("Invalid identity {value:?}: {reason}")]
    InvalidIdentity { value: String, reason: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
