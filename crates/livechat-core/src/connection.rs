//! Connection identity and role.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Longest client-supplied connection id accepted.
pub const MAX_CLIENT_ID_LEN: usize = 64;

/// Opaque identity of a live connection.
///
/// Visitors may propose their own id (e.g. persisted in a browser cookie);
/// agents get one derived from their authenticated name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Creates a ConnectionId without validation (server-side ids).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random id prefixed with the role label.
    pub fn generate(role: Role) -> Self {
        Self(format!("{}-{}", role.label(), uuid::Uuid::new_v4().simple()))
    }

    /// Validates an id proposed by a client.
    ///
    /// Accepts 1..=64 characters from `[A-Za-z0-9_.-]`.
    pub fn from_client(value: &str) -> DomainResult<Self> {
        if value.is_empty() || value.len() > MAX_CLIENT_ID_LEN {
            return Err(DomainError::InvalidIdentity {
                value: value.to_string(),
                reason: format!("length must be 1..={MAX_CLIENT_ID_LEN}"),
            });
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(DomainError::InvalidIdentity {
                value: value.to_string(),
                reason: "only ASCII letters, digits, '-', '_' and '.' are allowed".to_string(),
            });
        }
        Ok(Self(value.to_string()))
    }

    /// Validates `value` and places it in `role`'s namespace.
    ///
    /// The result always starts with `<role>-`; a value already carrying that
    /// prefix is kept as is, so a visitor can reconnect with the id it was
    /// handed. Visitors can never land on an `agent-` id.
    pub fn for_role(role: Role, value: &str) -> DomainResult<Self> {
        let valid = Self::from_client(value)?;
        let prefix = format!("{}-", role.label());
        if valid.0.starts_with(&prefix) {
            return Ok(valid);
        }
        Ok(Self(format!("{prefix}{}", valid.0)))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ConnectionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Which side of the conversation a connection is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Unauthenticated end-user seeking support.
    Visitor,
    /// Authenticated support staff.
    Agent,
}

impl Role {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Visitor => "visitor",
            Self::Agent => "agent",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
