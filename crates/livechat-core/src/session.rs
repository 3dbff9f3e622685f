//! Session domain entities and value objects.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{DomainError, DomainResult};
use crate::{ConnectionId, Envelope, Role};

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Unique identifier for a visitor/agent conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random session id.
    pub fn generate() -> Self {
        Self(format!("sess-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Session State
// ============================================================================

/// Lifecycle state of a session.
///
/// `Waiting → Active → Closed`, with `Waiting → Closed` allowed directly.
/// Idleness is not a state: it is the condition the reaper checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Visitor connected, no agent yet.
    #[default]
    Waiting,
    /// An agent claimed the session.
    Active,
    /// Terminal.
    Closed,
}

impl SessionState {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        !matches!(self, Self::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a session reached `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The visitor connection went away.
    VisitorLeft,
    /// The assigned agent connection went away.
    AgentLeft,
    /// The visitor sent an explicit close.
    ClosedByVisitor,
    /// The agent sent an explicit close.
    ClosedByAgent,
    /// No activity for longer than the idle timeout.
    IdleTimeout,
    /// A participant was missing from the registry outside of teardown.
    Inconsistency,
    /// The hub is shutting down.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VisitorLeft => write!(f, "visitor disconnected"),
            Self::AgentLeft => write!(f, "agent disconnected"),
            Self::ClosedByVisitor => write!(f, "closed by visitor"),
            Self::ClosedByAgent => write!(f, "closed by agent"),
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::Inconsistency => write!(f, "registry inconsistency"),
            Self::Shutdown => write!(f, "server shutdown"),
        }
    }
}

// ============================================================================
// Domain Entity
// ============================================================================

/// One visitor paired with zero or one agent.
///
/// Owned by the hub actor; nothing outside it mutates a session.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    visitor: ConnectionId,
    agent: Option<ConnectionId>,
    state: SessionState,
    close_reason: Option<CloseReason>,
    created_at: DateTime<Utc>,
    last_activity: Instant,
    /// Last sequence number handed out (0 = none yet)
    last_seq: u64,
    /// Messages accepted while `Waiting`, flushed to the agent on claim
    held: VecDeque<Envelope>,
    held_capacity: usize,
}

impl Session {
    /// Opens a `Waiting` session for a freshly registered visitor.
    pub fn open(id: SessionId, visitor: ConnectionId, now: Instant, held_capacity: usize) -> Self {
        Self {
            id,
            visitor,
            agent: None,
            state: SessionState::Waiting,
            close_reason: None,
            created_at: Utc::now(),
            last_activity: now,
            last_seq: 0,
            held: VecDeque::new(),
            held_capacity: held_capacity.max(1),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn visitor(&self) -> &ConnectionId {
        &self.visitor
    }

    pub fn agent(&self) -> Option<&ConnectionId> {
        self.agent.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    /// Returns the role `id` plays in this session, if any.
    pub fn role_of(&self, id: &ConnectionId) -> Option<Role> {
        if &self.visitor == id {
            Some(Role::Visitor)
        } else if self.agent.as_ref() == Some(id) {
            Some(Role::Agent)
        } else {
            None
        }
    }

    /// Returns the other participant for `id`, if the session has one.
    pub fn counterpart_of(&self, id: &ConnectionId) -> Option<&ConnectionId> {
        match self.role_of(id)? {
            Role::Visitor => self.agent.as_ref(),
            Role::Agent => Some(&self.visitor),
        }
    }

    /// Records activity. Never moves the timestamp backwards.
    pub fn touch(&mut self, at: Instant) {
        if at > self.last_activity {
            self.last_activity = at;
        }
    }

    /// True when nothing happened for longer than `timeout` as of `now`.
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        self.state.is_open() && now.saturating_duration_since(self.last_activity) > timeout
    }

    /// Hands out the next sequence number.
    pub fn next_seq(&mut self) -> u64 {
        self.last_seq = self.last_seq.saturating_add(1);
        self.last_seq
    }

    /// Compare-and-set on the agent slot.
    ///
    /// Succeeds only from `Waiting` with no agent; the first caller wins.
    pub fn try_assign(&mut self, agent: ConnectionId) -> DomainResult<()> {
        match (&self.state, &self.agent) {
            (SessionState::Closed, _) => Err(DomainError::SessionClosed {
                session_id: self.id.clone(),
            }),
            (_, Some(current)) => Err(DomainError::AlreadyAssigned {
                session_id: self.id.clone(),
                agent: current.clone(),
            }),
            (_, None) => {
                debug!(session_id = %self.id, agent = %agent, "Agent assigned");
                self.agent = Some(agent);
                self.state = SessionState::Active;
                Ok(())
            }
        }
    }

    /// Holds a message until an agent claims the session.
    ///
    /// Returns the oldest held message if the queue was full and it had to go.
    pub fn hold(&mut self, envelope: Envelope) -> Option<Envelope> {
        let dropped = if self.held.len() >= self.held_capacity {
            self.held.pop_front()
        } else {
            None
        };
        self.held.push_back(envelope);
        dropped
    }

    /// Drains held messages in acceptance order.
    pub fn take_held(&mut self) -> Vec<Envelope> {
        self.held.drain(..).collect()
    }

    /// Moves the session to `Closed`.
    ///
    /// Held messages are returned so the caller can report them as dropped.
    pub fn close(&mut self, reason: CloseReason) -> DomainResult<Vec<Envelope>> {
        if !self.state.is_open() {
            return Err(DomainError::SessionClosed {
                session_id: self.id.clone(),
            });
        }
        self.state = SessionState::Closed;
        self.close_reason = Some(reason);
        Ok(self.take_held())
    }

    /// Serializable snapshot for clients and diagnostics.
    pub fn view(&self, now: Instant) -> SessionView {
        SessionView {
            id: self.id.clone(),
            visitor: self.visitor.clone(),
            agent: self.agent.clone(),
            state: self.state,
            created_at: self.created_at,
            idle_secs: now.saturating_duration_since(self.last_activity).as_secs(),
            last_seq: self.last_seq,
            held: self.held.len(),
        }
    }
}

/// Read-only projection of a [`Session`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionView {
    pub id: SessionId,
    pub visitor: ConnectionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<ConnectionId>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub last_seq: u64,
    pub held: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::open(
            SessionId::new("sess-test"),
            ConnectionId::new("visitor-1"),
            Instant::now(),
            3,
        )
    }

    fn envelope(seq: u64) -> Envelope {
        Envelope {
            session_id: SessionId::new("sess-test"),
            seq,
            sender: ConnectionId::new("visitor-1"),
            sender_role: Role::Visitor,
            payload: format!("msg {seq}"),
            sent_at: Utc::now(),
            client_timestamp: None,
        }
    }

    #[test]
    fn test_new_session_is_waiting() {
        let s = session();
        assert_eq!(s.state(), SessionState::Waiting);
        assert!(s.agent().is_none());
        assert_eq!(s.last_seq(), 0);
    }

    #[test]
    fn test_sequence_strictly_increases() {
        let mut s = session();
        let seqs: Vec<u64> = (0..5).map(|_| s.next_seq()).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_first_claim_wins() {
        let mut s = session();
        assert!(s.try_assign(ConnectionId::new("agent-a")).is_ok());
        assert_eq!(s.state(), SessionState::Active);

        let err = s.try_assign(ConnectionId::new("agent-b")).unwrap_err();
        assert_eq!(
            err,
            DomainError::AlreadyAssigned {
                session_id: SessionId::new("sess-test"),
                agent: ConnectionId::new("agent-a"),
            }
        );
        assert_eq!(s.agent(), Some(&ConnectionId::new("agent-a")));
    }

    #[test]
    fn test_claim_on_closed_session_fails() {
        let mut s = session();
        s.close(CloseReason::VisitorLeft).unwrap();
        assert!(matches!(
            s.try_assign(ConnectionId::new("agent-a")),
            Err(DomainError::SessionClosed { .. })
        ));
    }

    #[test]
    fn test_hold_drops_oldest_when_full() {
        let mut s = session();
        assert!(s.hold(envelope(1)).is_none());
        assert!(s.hold(envelope(2)).is_none());
        assert!(s.hold(envelope(3)).is_none());
        let dropped = s.hold(envelope(4)).unwrap();
        assert_eq!(dropped.seq, 1);

        let held: Vec<u64> = s.take_held().iter().map(|e| e.seq).collect();
        assert_eq!(held, vec![2, 3, 4]);
        assert_eq!(s.held_len(), 0);
    }

    #[test]
    fn test_close_is_terminal_and_returns_held() {
        let mut s = session();
        s.hold(envelope(1));
        let dropped = s.close(CloseReason::IdleTimeout).unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(s.state(), SessionState::Closed);
        assert_eq!(s.close_reason(), Some(CloseReason::IdleTimeout));
        assert!(s.close(CloseReason::VisitorLeft).is_err());
    }

    #[test]
    fn test_touch_never_goes_backwards() {
        let start = Instant::now();
        let mut s = Session::open(SessionId::generate(), ConnectionId::new("v"), start, 1);
        let later = start + Duration::from_secs(10);
        s.touch(later);
        s.touch(start);
        assert_eq!(s.last_activity(), later);
    }

    #[test]
    fn test_idle_detection_uses_strict_timeout() {
        let start = Instant::now();
        let s = Session::open(SessionId::generate(), ConnectionId::new("v"), start, 1);
        let timeout = Duration::from_secs(30);
        assert!(!s.is_idle(start + Duration::from_secs(30), timeout));
        assert!(s.is_idle(start + Duration::from_secs(31), timeout));
    }

    #[test]
    fn test_counterpart_resolution() {
        let mut s = session();
        let visitor = ConnectionId::new("visitor-1");
        let agent = ConnectionId::new("agent-a");
        assert_eq!(s.counterpart_of(&visitor), None);
        s.try_assign(agent.clone()).unwrap();
        assert_eq!(s.counterpart_of(&visitor), Some(&agent));
        assert_eq!(s.counterpart_of(&agent), Some(&visitor));
        assert_eq!(s.role_of(&ConnectionId::new("stranger")), None);
    }

    #[test]
    fn test_view_reports_state() {
        let start = Instant::now();
        let mut s = Session::open(SessionId::new("sess-v"), ConnectionId::new("v"), start, 2);
        s.next_seq();
        let view = s.view(start + Duration::from_secs(5));
        assert_eq!(view.state, SessionState::Waiting);
        assert_eq!(view.idle_secs, 5);
        assert_eq!(view.last_seq, 1);
        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("\"agent\""));
    }

    #[test]
    fn test_close_reason_display() {
        assert_eq!(CloseReason::IdleTimeout.to_string(), "idle timeout");
        assert_eq!(CloseReason::AgentLeft.to_string(), "agent disconnected");
        assert_eq!(
            serde_json::to_string(&CloseReason::ClosedByAgent).unwrap(),
            "\"closed_by_agent\""
        );
    }
}
