//! livechat protocol - wire format for hub connections
//!
//! Newline-delimited JSON frames tagged by `type`. Visitors and agents share
//! one message set; the role is fixed by the `connect` handshake.

pub mod message;
pub mod sequence;
pub mod version;

pub use message::{codes, ClientMessage, MessageType, ServerMessage};
pub use sequence::{SequenceCheck, SequenceTracker};
pub use version::{ProtocolVersion, VersionError};
