//! Protocol message types exchanged with visitor and agent clients.

use crate::version::ProtocolVersion;
use livechat_core::{CloseReason, ConnectionId, Envelope, Role, SessionId, SessionView};
use serde::{Deserialize, Serialize};

/// Message types a client can send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Handshake; must be the first frame on a connection
    Connect {
        role: Role,
        /// Identity proposed by a visitor (e.g. from a cookie)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        /// Bearer token, required for agents
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },

    /// Chat text. Visitors may omit `session_id`; agents must set it.
    Text {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        payload: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_timestamp: Option<i64>,
    },

    /// Agent takes ownership of a waiting session
    Claim { session_id: SessionId },

    /// Either party ends a session
    Close {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },

    /// Agent asks for the sessions still waiting for an agent
    ListWaiting,

    Ping { seq: u64 },
}

/// Frame sent from a client to the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(default)]
    pub protocol_version: ProtocolVersion,

    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Wraps a message with the current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    /// Anonymous visitor handshake.
    pub fn connect_visitor(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect {
            role: Role::Visitor,
            client_id,
            token: None,
            display_name: None,
        })
    }

    /// Agent handshake carrying a bearer token.
    pub fn connect_agent(token: impl Into<String>) -> Self {
        Self::new(MessageType::Connect {
            role: Role::Agent,
            client_id: None,
            token: Some(token.into()),
            display_name: None,
        })
    }

    pub fn text(session_id: Option<SessionId>, payload: impl Into<String>) -> Self {
        Self::new(MessageType::Text {
            session_id,
            payload: payload.into(),
            client_timestamp: None,
        })
    }

    pub fn claim(session_id: SessionId) -> Self {
        Self::new(MessageType::Claim { session_id })
    }

    pub fn close(session_id: Option<SessionId>) -> Self {
        Self::new(MessageType::Close { session_id })
    }

    pub fn list_waiting() -> Self {
        Self::new(MessageType::ListWaiting)
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }
}

/// Machine-readable failure codes carried by `delivery_failed` and `error`.
pub mod codes {
    pub const RECIPIENT_NOT_FOUND: &str = "recipient_not_found";
    pub const NOT_ASSIGNED: &str = "not_assigned";
    pub const REGISTRY_INCONSISTENCY: &str = "registry_inconsistency";
    pub const MALFORMED_ENVELOPE: &str = "malformed_envelope";
    pub const UNEXPECTED_MESSAGE: &str = "unexpected_message";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const INTERNAL: &str = "internal";
}

/// Frames sent from the hub to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake accepted
    Connected {
        protocol_version: ProtocolVersion,
        connection_id: ConnectionId,
        role: Role,
        /// The visitor's session; absent for agents
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },

    /// Handshake refused (version, auth, duplicate identity, capacity)
    Rejected {
        reason: String,
        protocol_version: ProtocolVersion,
    },

    /// A chat message from the other party
    Message { envelope: Envelope },

    /// The sender's message was admitted and sequenced
    Accepted { session_id: SessionId, seq: u64 },

    /// Message dropped by admission control
    Throttled { retry_after_ms: u64 },

    /// Message could not be routed
    DeliveryFailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        code: String,
        reason: String,
    },

    /// Sent to the winning agent and the visitor after a claim
    AgentAssigned {
        session_id: SessionId,
        agent: ConnectionId,
        visitor: ConnectionId,
    },

    /// Sent to an agent whose claim lost
    ClaimRejected { session_id: SessionId, reason: String },

    SessionClosed {
        session_id: SessionId,
        reason: CloseReason,
    },

    /// A waiting visitor said something; any agent may claim
    AwaitingAgent {
        session_id: SessionId,
        visitor: ConnectionId,
        seq: u64,
        preview: String,
    },

    /// Sessions still waiting for an agent
    WaitingList { sessions: Vec<SessionView> },

    Pong { seq: u64 },

    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl ServerMessage {
    pub fn connected(connection_id: ConnectionId, role: Role, session_id: Option<SessionId>) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            connection_id,
            role,
            session_id,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn message(envelope: Envelope) -> Self {
        Self::Message { envelope }
    }

    pub fn delivery_failed(
        session_id: Option<SessionId>,
        code: &str,
        reason: impl Into<String>,
    ) -> Self {
        Self::DeliveryFailed {
            session_id,
            code: code.to_string(),
            reason: reason.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code: None,
        }
    }

    pub fn error_with_code(message: impl Into<String>, code: &str) -> Self {
        Self::Error {
            message: message.into(),
            code: Some(code.to_string()),
        }
    }

    /// Wire name of the variant, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Rejected { .. } => "rejected",
            Self::Message { .. } => "message",
            Self::Accepted { .. } => "accepted",
            Self::Throttled { .. } => "throttled",
            Self::DeliveryFailed { .. } => "delivery_failed",
            Self::AgentAssigned { .. } => "agent_assigned",
            Self::ClaimRejected { .. } => "claim_rejected",
            Self::SessionClosed { .. } => "session_closed",
            Self::AwaitingAgent { .. } => "awaiting_agent",
            Self::WaitingList { .. } => "waiting_list",
            Self::Pong { .. } => "pong",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_wire_shape() {
        let json = serde_json::to_string(&ClientMessage::ping(42)).unwrap();
        assert!(json.contains("\"type\":\"ping\""));
        assert!(json.contains("\"seq\":42"));
        assert!(json.contains("\"protocol_version\":{\"major\":1,\"minor\":0}"));
    }

    #[test]
    fn test_visitor_text_without_session() {
        let raw = r#"{"protocol_version":{"major":1,"minor":0},"type":"text","payload":"hi"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            msg.message,
            MessageType::Text {
                session_id: None,
                payload: "hi".to_string(),
                client_timestamp: None,
            }
        );
    }

    #[test]
    fn test_protocol_version_defaults_when_omitted() {
        let raw = r#"{"type":"claim","session_id":"sess-1"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.protocol_version, ProtocolVersion::CURRENT);
        assert_eq!(
            msg.message,
            MessageType::Claim {
                session_id: SessionId::new("sess-1")
            }
        );
    }

    #[test]
    fn test_agent_connect_parses_token() {
        let raw = r#"{"type":"connect","role":"agent","token":"abc"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg.message {
            MessageType::Connect { role, token, client_id, .. } => {
                assert_eq!(role, Role::Agent);
                assert_eq!(token.as_deref(), Some("abc"));
                assert!(client_id.is_none());
            }
            other => panic!("Expected Connect, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let raw = r#"{"type":"subscribe"}"#;
        assert!(serde_json::from_str::<ClientMessage>(raw).is_err());
    }

    #[test]
    fn test_server_message_tags() {
        let msg = ServerMessage::SessionClosed {
            session_id: SessionId::new("sess-1"),
            reason: CloseReason::IdleTimeout,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"session_closed\""));
        assert!(json.contains("\"reason\":\"idle_timeout\""));
        assert_eq!(msg.kind(), "session_closed");

        let failed = ServerMessage::delivery_failed(None, codes::RECIPIENT_NOT_FOUND, "gone");
        let json = serde_json::to_string(&failed).unwrap();
        assert!(json.contains("\"code\":\"recipient_not_found\""));
        assert!(!json.contains("session_id"));
    }
}
