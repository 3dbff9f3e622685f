//! Session table with visitor and agent indexes.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use livechat_core::{ConnectionId, DomainResult, Session, SessionId, SessionState, SessionView};
use tokio::time::Instant;

use super::commands::IdleCandidate;

/// Open sessions. A session leaves the table when it closes.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<SessionId, Session>,
    by_visitor: HashMap<ConnectionId, SessionId>,
    by_agent: HashMap<ConnectionId, HashSet<SessionId>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a `Waiting` session for `visitor`.
    pub fn open(&mut self, visitor: ConnectionId, at: Instant, held_capacity: usize) -> SessionId {
        let id = SessionId::generate();
        let session = Session::open(id.clone(), visitor.clone(), at, held_capacity);
        self.by_visitor.insert(visitor, id.clone());
        self.sessions.insert(id.clone(), session);
        id
    }

    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    pub fn of_visitor(&self, visitor: &ConnectionId) -> Option<&SessionId> {
        self.by_visitor.get(visitor)
    }

    pub fn of_agent(&self, agent: &ConnectionId) -> Vec<SessionId> {
        self.by_agent
            .get(agent)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// True when the agent owns at least one session.
    pub fn agent_is_busy(&self, agent: &ConnectionId) -> bool {
        self.by_agent.get(agent).is_some_and(|ids| !ids.is_empty())
    }

    /// Claims `id` for `agent`; the first caller wins.
    pub fn assign(&mut self, id: &SessionId, agent: ConnectionId) -> DomainResult<()> {
        let Some(session) = self.sessions.get_mut(id) else {
            return Err(livechat_core::DomainError::SessionClosed {
                session_id: id.clone(),
            });
        };
        session.try_assign(agent.clone())?;
        self.by_agent.entry(agent).or_default().insert(id.clone());
        Ok(())
    }

    /// Removes a session and its index entries.
    pub fn remove(&mut self, id: &SessionId) -> Option<Session> {
        let session = self.sessions.remove(id)?;
        if self.by_visitor.get(session.visitor()) == Some(id) {
            self.by_visitor.remove(session.visitor());
        }
        if let Some(agent) = session.agent() {
            if let Some(owned) = self.by_agent.get_mut(agent) {
                owned.remove(id);
                if owned.is_empty() {
                    self.by_agent.remove(agent);
                }
            }
        }
        Some(session)
    }

    /// Waiting sessions, oldest first.
    pub fn waiting_views(&self, now: Instant) -> Vec<SessionView> {
        let mut views: Vec<SessionView> = self
            .sessions
            .values()
            .filter(|s| s.state() == SessionState::Waiting)
            .map(|s| s.view(now))
            .collect();
        views.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.as_str().cmp(b.id.as_str())));
        views
    }

    pub fn idle_candidates(&self, now: Instant, idle_timeout: Duration) -> Vec<IdleCandidate> {
        self.sessions
            .values()
            .filter(|s| s.is_idle(now, idle_timeout))
            .map(|s| IdleCandidate {
                session_id: s.id().clone(),
                last_activity: s.last_activity(),
            })
            .collect()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().cloned().collect()
    }

    pub fn count_by_state(&self, state: SessionState) -> usize {
        self.sessions.values().filter(|s| s.state() == state).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
