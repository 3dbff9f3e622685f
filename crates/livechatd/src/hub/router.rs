//! Message routing, claims and explicit closes.
//!
//! These run inside the hub actor, so each one sees and mutates a consistent
//! snapshot of registry and sessions.

use chrono::Utc;
use livechat_core::{CloseReason, ConnectionId, DomainError, Envelope, Role, SessionId};
use livechat_protocol::ServerMessage;
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::actor::HubActor;
use super::commands::{HubError, HubEvent, RouteOutcome, RouteRequest};
use crate::config::BroadcastPolicy;
use crate::transcript::{DropReason, TranscriptEvent};

impl HubActor {
    fn role_of(&self, id: &ConnectionId) -> Result<Role, HubError> {
        self.registry
            .lookup(id)
            .map(|e| e.role)
            .ok_or_else(|| HubError::NotRegistered(id.clone()))
    }

    /// Picks the session a request refers to.
    ///
    /// Visitors default to their own session; agents must name one.
    fn resolve_session(
        &self,
        sender: &ConnectionId,
        role: Role,
        session_id: Option<SessionId>,
    ) -> Result<SessionId, HubError> {
        match (role, session_id) {
            (_, Some(session_id)) => Ok(session_id),
            (Role::Visitor, None) => self
                .sessions
                .of_visitor(sender)
                .cloned()
                .ok_or(HubError::RecipientNotFound { session_id: None }),
            (Role::Agent, None) => Err(HubError::SessionRequired),
        }
    }

    /// Checks `sender` participates in `session_id`.
    fn authorize(
        &self,
        sender: &ConnectionId,
        role: Role,
        session_id: &SessionId,
    ) -> Result<Role, HubError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| HubError::RecipientNotFound {
                session_id: Some(session_id.clone()),
            })?;
        match (session.role_of(sender), role) {
            (Some(participant), _) => Ok(participant),
            (None, Role::Agent) => Err(HubError::NotAssigned {
                session_id: session_id.clone(),
                agent: sender.clone(),
            }),
            // A visitor cannot even learn that another session exists
            (None, Role::Visitor) => Err(HubError::RecipientNotFound {
                session_id: Some(session_id.clone()),
            }),
        }
    }

    /// Fails and force-closes the session if `id` vanished from the registry.
    fn require_registered(
        &mut self,
        session_id: &SessionId,
        id: &ConnectionId,
        at: Instant,
    ) -> Result<(), HubError> {
        if self.registry.contains(id) {
            return Ok(());
        }
        error!(
            session_id = %session_id,
            missing = %id,
            "Session references an unregistered connection"
        );
        self.close_session(session_id, CloseReason::Inconsistency, at);
        Err(HubError::RegistryInconsistency {
            session_id: session_id.clone(),
            missing: id.clone(),
        })
    }

    // ========================================================================
    // Route
    // ========================================================================

    pub(super) fn handle_route(&mut self, request: RouteRequest) -> Result<RouteOutcome, HubError> {
        let RouteRequest {
            sender,
            session_id,
            payload,
            client_timestamp,
            at,
        } = request;

        let role = self.role_of(&sender)?;
        if let Some(entry) = self.registry.lookup_mut(&sender) {
            entry.touch(at);
        }
        let session_id = self.resolve_session(&sender, role, session_id)?;
        let sender_role = self.authorize(&sender, role, &session_id)?;

        let counterpart = self
            .sessions
            .get(&session_id)
            .and_then(|s| s.counterpart_of(&sender).cloned());
        if let Some(counterpart) = &counterpart {
            self.require_registered(&session_id, counterpart, at)?;
        }

        let (envelope, evicted) = {
            let session = self
                .sessions
                .get_mut(&session_id)
                .ok_or_else(|| HubError::RecipientNotFound {
                    session_id: Some(session_id.clone()),
                })?;
            session.touch(at);
            let envelope = Envelope {
                session_id: session_id.clone(),
                seq: session.next_seq(),
                sender: sender.clone(),
                sender_role,
                payload,
                sent_at: Utc::now(),
                client_timestamp,
            };
            let evicted = match counterpart {
                Some(_) => None,
                None => session.hold(envelope.clone()),
            };
            (envelope, evicted)
        };
        self.messages_routed = self.messages_routed.saturating_add(1);
        let seq = envelope.seq;

        match counterpart {
            Some(recipient) => {
                debug!(session_id = %session_id, seq, recipient = %recipient, "Routing message");
                self.deliver(&recipient, envelope);
                Ok(RouteOutcome::Delivered { session_id, seq })
            }
            None => {
                if let Some(dropped) = evicted {
                    debug!(session_id = %session_id, seq = dropped.seq, "Waiting queue full, dropped oldest");
                    self.transcript.record(TranscriptEvent::Dropped {
                        envelope: dropped,
                        reason: DropReason::WaitingQueueFull,
                    });
                }
                self.broadcast_awaiting(&envelope);
                Ok(RouteOutcome::Held { session_id, seq })
            }
        }
    }

    /// Tells agents a waiting visitor said something.
    fn broadcast_awaiting(&self, envelope: &Envelope) {
        let notice = ServerMessage::AwaitingAgent {
            session_id: envelope.session_id.clone(),
            visitor: envelope.sender.clone(),
            seq: envelope.seq,
            preview: envelope.preview(self.config.preview_chars),
        };
        let mut notified = 0usize;
        for agent in self.registry.list_by_role(Role::Agent) {
            if self.config.broadcast == BroadcastPolicy::IdleAgents
                && self.sessions.agent_is_busy(&agent)
            {
                continue;
            }
            if self.send_to(&agent, notice.clone()) {
                notified += 1;
            }
        }
        debug!(session_id = %envelope.session_id, notified, "Awaiting-agent broadcast");
    }

    // ========================================================================
    // Claim
    // ========================================================================

    pub(super) fn handle_claim(
        &mut self,
        agent: ConnectionId,
        session_id: SessionId,
        at: Instant,
    ) -> Result<(), HubError> {
        let role = self.role_of(&agent)?;
        if role != Role::Agent {
            return Err(HubError::WrongRole { id: agent, role });
        }

        let visitor = self
            .sessions
            .get(&session_id)
            .map(|s| (s.visitor().clone(), s.agent() == Some(&agent)))
            .ok_or_else(|| HubError::RecipientNotFound {
                session_id: Some(session_id.clone()),
            });
        let (visitor, already_ours) = visitor?;
        if already_ours {
            return Ok(());
        }
        self.require_registered(&session_id, &visitor, at)?;

        self.sessions
            .assign(&session_id, agent.clone())
            .map_err(|e| match e {
                DomainError::AlreadyAssigned { agent: owner, .. } => HubError::ClaimRejected {
                    session_id: session_id.clone(),
                    reason: format!("already assigned to {owner}"),
                },
                DomainError::SessionClosed { .. } => HubError::RecipientNotFound {
                    session_id: Some(session_id.clone()),
                },
                other => HubError::ClaimRejected {
                    session_id: session_id.clone(),
                    reason: other.to_string(),
                },
            })?;

        let held = match self.sessions.get_mut(&session_id) {
            Some(session) => {
                session.touch(at);
                session.take_held()
            }
            None => Vec::new(),
        };
        if let Some(entry) = self.registry.lookup_mut(&agent) {
            entry.touch(at);
        }

        let assigned = ServerMessage::AgentAssigned {
            session_id: session_id.clone(),
            agent: agent.clone(),
            visitor: visitor.clone(),
        };
        self.send_to(&agent, assigned.clone());
        self.send_to(&visitor, assigned);
        let flushed = held.len();
        for envelope in held {
            self.deliver(&agent, envelope);
        }

        info!(
            session_id = %session_id,
            agent = %agent,
            visitor = %visitor,
            flushed,
            "Session claimed"
        );
        self.publish(HubEvent::AgentAssigned {
            session_id,
            agent,
        });
        self.push_waiting_list(at);
        Ok(())
    }

    // ========================================================================
    // Close
    // ========================================================================

    pub(super) fn handle_close_request(
        &mut self,
        requester: &ConnectionId,
        session_id: Option<SessionId>,
        at: Instant,
    ) -> Result<SessionId, HubError> {
        let role = self.role_of(requester)?;
        let session_id = self.resolve_session(requester, role, session_id)?;
        let reason = match self.authorize(requester, role, &session_id)? {
            Role::Visitor => CloseReason::ClosedByVisitor,
            Role::Agent => CloseReason::ClosedByAgent,
        };
        self.close_session(&session_id, reason, at);
        Ok(session_id)
    }
}
