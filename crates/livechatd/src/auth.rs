//! Connection authentication.
//!
//! Visitors are anonymous: they may propose a client id (validated and
//! placed under `visitor-`) or get a generated one. Agents must present an
//! HS256 JWT whose `sub` names them; their connection id becomes
//! `agent-<sub>`. The two namespaces never overlap.

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use livechat_core::{ConnectionId, DomainError, Role};

/// What a client asked for in its `connect` frame.
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    pub role: Option<Role>,
    pub client_id: Option<String>,
    pub token: Option<String>,
    pub display_name: Option<String>,
}

/// Who a connection turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: ConnectionId,
    pub role: Role,
    pub display_name: Option<String>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Agent connections require a token")]
    MissingToken,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error(transparent)]
    InvalidIdentity(#[from] DomainError),

    #[error("Agent authentication is not configured")]
    NotConfigured,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, request: ConnectRequest) -> Result<Identity, AuthError>;
}

/// Claims carried by an agent token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentClaims {
    /// Agent login name
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub iat: u64,
    pub exp: u64,
}

#[derive(Clone)]
pub struct JwtAuthenticator {
    secret: String,
}

impl std::fmt::Debug for JwtAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtAuthenticator").finish_non_exhaustive()
    }
}

impl JwtAuthenticator {
    /// An empty secret is allowed; every agent is then rejected.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Signs a token for `sub` valid for `ttl_secs`.
    pub fn issue_token(
        &self,
        sub: &str,
        name: Option<&str>,
        ttl_secs: u64,
    ) -> Result<String, AuthError> {
        if self.secret.is_empty() {
            return Err(AuthError::NotConfigured);
        }
        let now = u64::try_from(Utc::now().timestamp()).unwrap_or(0);
        let claims = AgentClaims {
            sub: sub.to_string(),
            name: name.map(str::to_string),
            iat: now,
            exp: now.saturating_add(ttl_secs),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }

    pub fn verify(&self, token: &str) -> Result<AgentClaims, AuthError> {
        if self.secret.is_empty() {
            return Err(AuthError::NotConfigured);
        }
        let validation = Validation::new(Algorithm::HS256);
        decode::<AgentClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, request: ConnectRequest) -> Result<Identity, AuthError> {
        match request.role.unwrap_or(Role::Visitor) {
            Role::Visitor => {
                let id = match request.client_id.as_deref() {
                    Some(proposed) => ConnectionId::for_role(Role::Visitor, proposed)?,
                    None => ConnectionId::generate(Role::Visitor),
                };
                Ok(Identity {
                    id,
                    role: Role::Visitor,
                    display_name: request.display_name,
                })
            }
            Role::Agent => {
                let token = request.token.as_deref().ok_or(AuthError::MissingToken)?;
                let claims = self.verify(token)?;
                let id = ConnectionId::for_role(Role::Agent, &claims.sub)?;
                debug!(agent = %id, "Agent token verified");
                Ok(Identity {
                    id,
                    role: Role::Agent,
                    display_name: claims.name.or(request.display_name),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-with-enough-entropy-0123456789";

    fn agent_request(token: Option<String>) -> ConnectRequest {
        ConnectRequest {
            role: Some(Role::Agent),
            token,
            ..ConnectRequest::default()
        }
    }

    #[tokio::test]
    async fn test_visitor_gets_generated_id() {
        let auth = JwtAuthenticator::new(SECRET);
        let identity = auth.authenticate(ConnectRequest::default()).await.unwrap();
        assert_eq!(identity.role, Role::Visitor);
        assert!(identity.id.as_str().starts_with("visitor-"));
    }

    #[tokio::test]
    async fn test_visitor_proposed_id_is_validated() {
        let auth = JwtAuthenticator::new(SECRET);
        let ok = auth
            .authenticate(ConnectRequest {
                client_id: Some("cookie-123".to_string()),
                ..ConnectRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(ok.id.as_str(), "visitor-cookie-123");

        let err = auth
            .authenticate(ConnectRequest {
                client_id: Some("bad id!".to_string()),
                ..ConnectRequest::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidIdentity(_)));
    }

    #[tokio::test]
    async fn test_agent_token_roundtrip() {
        let auth = JwtAuthenticator::new(SECRET);
        let token = auth.issue_token("alice", Some("Alice"), 60).unwrap();
        let identity = auth.authenticate(agent_request(Some(token))).await.unwrap();
        assert_eq!(identity.id.as_str(), "agent-alice");
        assert_eq!(identity.role, Role::Agent);
        assert_eq!(identity.display_name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn test_visitor_cannot_take_agent_identity() {
        let auth = JwtAuthenticator::new(SECRET);
        let visitor = auth
            .authenticate(ConnectRequest {
                client_id: Some("agent-alice".to_string()),
                ..ConnectRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(visitor.role, Role::Visitor);
        assert!(visitor.id.as_str().starts_with("visitor-"));

        let token = auth.issue_token("alice", None, 60).unwrap();
        let agent = auth.authenticate(agent_request(Some(token))).await.unwrap();
        assert_eq!(agent.id.as_str(), "agent-alice");
        assert_ne!(visitor.id, agent.id);
    }

    #[tokio::test]
    async fn test_agent_without_token_is_rejected() {
        let auth = JwtAuthenticator::new(SECRET);
        let err = auth.authenticate(agent_request(None)).await.unwrap_err();
        assert!(matches!(err, AuthError::MissingToken));
    }

    #[tokio::test]
    async fn test_token_signed_with_other_secret_is_rejected() {
        let other = JwtAuthenticator::new("another-secret-entirely-0123456789abcdef");
        let token = other.issue_token("mallory", None, 60).unwrap();
        let auth = JwtAuthenticator::new(SECRET);
        let err = auth.authenticate(agent_request(Some(token))).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn test_unconfigured_secret_rejects_agents() {
        let auth = JwtAuthenticator::new("");
        let err = auth
            .authenticate(agent_request(Some("x.y.z".to_string())))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NotConfigured));
    }
}
