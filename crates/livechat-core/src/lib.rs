//! livechat core - shared domain types for the chat hub
//!
//! This crate provides the domain types shared between
//! the daemon (livechatd) and the wire protocol.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod connection;
pub mod envelope;
pub mod error;
pub mod session;

// Re-exports for convenience
pub use connection::{ConnectionId, Role};
pub use envelope::Envelope;
pub use error::{DomainError, DomainResult};
pub use session::{CloseReason, Session, SessionId, SessionState, SessionView};
