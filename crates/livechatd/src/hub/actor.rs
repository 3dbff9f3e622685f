//! Hub actor - owns the connection registry and the session table.
//!
//! The HubActor is the single owner of routing state. It receives commands
//! via an mpsc channel, processes them one at a time, and publishes
//! lifecycle events via broadcast. Because commands are serialized, a claim
//! is a true compare-and-set and an unregister removes the connection and
//! closes its sessions in the same step.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Reply send failures are ignored (the caller went away)
//! - Outbound pushes never block; overflow is reported, not awaited

use std::sync::Arc;

use livechat_core::{CloseReason, ConnectionId, Envelope, Role, SessionId, SessionState};
use livechat_protocol::ServerMessage;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::commands::{
    ConnectionInfo, HubCommand, HubError, HubEvent, HubStats, IdleCandidate, NewConnection,
    Registered,
};
use super::registry::{ConnectionEntry, ConnectionRegistry};
use super::sessions::SessionTable;
use super::HubConfig;
use crate::outbound::PushOutcome;
use crate::transcript::{DropReason, TranscriptEvent, TranscriptSink};

// ============================================================================
// Hub Actor
// ============================================================================

pub struct HubActor {
    receiver: mpsc::Receiver<HubCommand>,
    event_publisher: broadcast::Sender<HubEvent>,
    pub(super) config: HubConfig,
    pub(super) registry: ConnectionRegistry,
    pub(super) sessions: SessionTable,
    pub(super) transcript: Arc<dyn TranscriptSink>,
    pub(super) messages_routed: u64,
    sessions_closed: u64,
}

impl HubActor {
    pub fn new(
        receiver: mpsc::Receiver<HubCommand>,
        event_publisher: broadcast::Sender<HubEvent>,
        config: HubConfig,
        transcript: Arc<dyn TranscriptSink>,
    ) -> Self {
        Self {
            receiver,
            event_publisher,
            registry: ConnectionRegistry::new(config.max_connections),
            sessions: SessionTable::new(),
            config,
            transcript,
            messages_routed: 0,
            sessions_closed: 0,
        }
    }

    /// Runs until every handle is dropped.
    pub async fn run(mut self) {
        info!("Hub actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(
            connections = self.registry.len(),
            sessions = self.sessions.len(),
            "Hub actor stopped"
        );
    }

    pub(super) fn handle_command(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register {
                connection,
                at,
                respond_to,
            } => {
                let result = self.handle_register(connection, at);
                let _ = respond_to.send(result);
            }
            HubCommand::Unregister { id, at, respond_to } => {
                let removed = self.handle_unregister(&id, at);
                let _ = respond_to.send(removed);
            }
            HubCommand::Lookup { id, at, respond_to } => {
                let _ = respond_to.send(self.handle_lookup(&id, at));
            }
            HubCommand::ListByRole { role, respond_to } => {
                let _ = respond_to.send(self.registry.list_by_role(role));
            }
            HubCommand::Route {
                request,
                respond_to,
            } => {
                let result = self.handle_route(request);
                let _ = respond_to.send(result);
            }
            HubCommand::Claim {
                agent,
                session_id,
                at,
                respond_to,
            } => {
                let result = self.handle_claim(agent, session_id, at);
                let _ = respond_to.send(result);
            }
            HubCommand::CloseSession {
                requester,
                session_id,
                at,
                respond_to,
            } => {
                let result = self.handle_close_request(&requester, session_id, at);
                let _ = respond_to.send(result);
            }
            HubCommand::Touch { id, at } => {
                self.handle_touch(&id, at);
            }
            HubCommand::WaitingSessions { at, respond_to } => {
                let _ = respond_to.send(self.sessions.waiting_views(at));
            }
            HubCommand::GetSession {
                session_id,
                at,
                respond_to,
            } => {
                let view = self.sessions.get(&session_id).map(|s| s.view(at));
                let _ = respond_to.send(view);
            }
            HubCommand::IdleSessions {
                now,
                idle_timeout,
                respond_to,
            } => {
                let _ = respond_to.send(self.sessions.idle_candidates(now, idle_timeout));
            }
            HubCommand::ExpireSession {
                candidate,
                idle_timeout,
                now,
                respond_to,
            } => {
                let expired = self.handle_expire(candidate, idle_timeout, now);
                let _ = respond_to.send(expired);
            }
            HubCommand::Stats { respond_to } => {
                let _ = respond_to.send(self.stats());
            }
            HubCommand::Shutdown { at, respond_to } => {
                let _ = respond_to.send(self.handle_shutdown(at));
            }
        }
    }

    // ========================================================================
    // Registry Handlers
    // ========================================================================

    fn handle_register(
        &mut self,
        connection: NewConnection,
        at: Instant,
    ) -> Result<Registered, HubError> {
        let id = connection.id.clone();
        let role = connection.role;

        if let Err(e) = self.registry.register(ConnectionEntry::new(connection, at)) {
            warn!(connection_id = %id, error = %e, "Registration rejected");
            return Err(e);
        }

        let session_id = match role {
            Role::Visitor => Some(self.sessions.open(
                id.clone(),
                at,
                self.config.waiting_queue_capacity,
            )),
            Role::Agent => None,
        };

        // Connected must be the first frame the client sees
        self.send_to(&id, ServerMessage::connected(id.clone(), role, session_id.clone()));

        match &session_id {
            Some(session_id) => {
                self.publish(HubEvent::SessionOpened {
                    session_id: session_id.clone(),
                    visitor: id.clone(),
                });
                self.push_waiting_list(at);
            }
            None => {
                let sessions = self.sessions.waiting_views(at);
                self.send_to(&id, ServerMessage::WaitingList { sessions });
            }
        }

        info!(
            connection_id = %id,
            role = %role,
            session_id = ?session_id,
            total = self.registry.len(),
            "Connection registered"
        );
        self.publish(HubEvent::ConnectionRegistered {
            id: id.clone(),
            role,
        });

        Ok(Registered { id, session_id })
    }

    fn handle_unregister(&mut self, id: &ConnectionId, at: Instant) -> bool {
        let Some(entry) = self.registry.unregister(id) else {
            debug!(connection_id = %id, "Unregister of unknown connection ignored");
            return false;
        };
        entry.shutdown();

        match entry.role {
            Role::Visitor => {
                if let Some(session_id) = self.sessions.of_visitor(id).cloned() {
                    self.close_session(&session_id, CloseReason::VisitorLeft, at);
                }
            }
            Role::Agent => {
                for session_id in self.sessions.of_agent(id) {
                    self.close_session(&session_id, CloseReason::AgentLeft, at);
                }
            }
        }

        info!(
            connection_id = %id,
            role = %entry.role,
            total = self.registry.len(),
            "Connection unregistered"
        );
        self.publish(HubEvent::ConnectionUnregistered {
            id: entry.id.clone(),
            role: entry.role,
        });
        true
    }

    fn handle_lookup(&self, id: &ConnectionId, now: Instant) -> Option<ConnectionInfo> {
        let entry = self.registry.lookup(id)?;
        let sessions: Vec<SessionId> = match entry.role {
            Role::Visitor => self.sessions.of_visitor(id).cloned().into_iter().collect(),
            Role::Agent => self.sessions.of_agent(id),
        };
        Some(entry.info(sessions, now))
    }

    fn handle_touch(&mut self, id: &ConnectionId, at: Instant) {
        let Some(entry) = self.registry.lookup_mut(id) else {
            return;
        };
        entry.touch(at);
        // A visitor heartbeat keeps its session alive
        if entry.role == Role::Visitor {
            if let Some(session_id) = self.sessions.of_visitor(id).cloned() {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.touch(at);
                }
            }
        }
    }

    // ========================================================================
    // Expiry and Shutdown
    // ========================================================================

    /// Re-validates a reaper candidate before closing it.
    fn handle_expire(&mut self, candidate: IdleCandidate, idle_timeout: Duration, now: Instant) -> bool {
        let still_idle = self.sessions.get(&candidate.session_id).is_some_and(|s| {
            s.last_activity() == candidate.last_activity && s.is_idle(now, idle_timeout)
        });
        if !still_idle {
            debug!(
                session_id = %candidate.session_id,
                "Session changed since snapshot, not expiring"
            );
            return false;
        }
        self.close_session(&candidate.session_id, CloseReason::IdleTimeout, now)
    }

    fn handle_shutdown(&mut self, at: Instant) -> usize {
        for session_id in self.sessions.ids() {
            self.close_session(&session_id, CloseReason::Shutdown, at);
        }
        let remaining = self.registry.ids();
        let closed = remaining.len();
        for id in remaining {
            self.handle_unregister(&id, at);
        }
        info!(agents_closed = closed, "Hub shut down all sessions");
        closed
    }

    fn stats(&self) -> HubStats {
        HubStats {
            visitors: self.registry.count_by_role(Role::Visitor),
            agents: self.registry.count_by_role(Role::Agent),
            waiting_sessions: self.sessions.count_by_state(SessionState::Waiting),
            active_sessions: self.sessions.count_by_state(SessionState::Active),
            messages_routed: self.messages_routed,
            sessions_closed: self.sessions_closed,
            outbound_overflows: self.registry.overflow_total(),
        }
    }

    // ========================================================================
    // Shared Helpers
    // ========================================================================

    /// Closes a session, notifies its participants, and shuts down the
    /// visitor connection. Returns false if the session was already gone.
    pub(super) fn close_session(
        &mut self,
        session_id: &SessionId,
        reason: CloseReason,
        at: Instant,
    ) -> bool {
        let Some(mut session) = self.sessions.remove(session_id) else {
            return false;
        };
        let was_waiting = session.state() == SessionState::Waiting;

        match session.close(reason) {
            Ok(held) => {
                for envelope in held {
                    self.transcript.record(TranscriptEvent::Dropped {
                        envelope,
                        reason: DropReason::SessionClosed,
                    });
                }
            }
            Err(e) => warn!(session_id = %session_id, error = %e, "Session already closed"),
        }

        let notice = ServerMessage::SessionClosed {
            session_id: session_id.clone(),
            reason,
        };
        if let Some(agent) = session.agent() {
            self.send_to(agent, notice.clone());
        }

        // A visitor never outlives its session
        if let Some(visitor) = self.registry.unregister(session.visitor()) {
            let _ = visitor.send(notice);
            visitor.shutdown();
            self.publish(HubEvent::ConnectionUnregistered {
                id: visitor.id.clone(),
                role: visitor.role,
            });
        }

        self.sessions_closed = self.sessions_closed.saturating_add(1);
        info!(
            session_id = %session_id,
            reason = %reason,
            last_seq = session.last_seq(),
            "Session closed"
        );
        self.publish(HubEvent::SessionClosed {
            session_id: session_id.clone(),
            reason,
        });

        if was_waiting {
            self.push_waiting_list(at);
        }
        true
    }

    /// Queues a frame for `id`. Returns false if the connection is unknown
    /// or shutting down.
    pub(super) fn send_to(&self, id: &ConnectionId, frame: ServerMessage) -> bool {
        let Some(entry) = self.registry.lookup(id) else {
            return false;
        };
        match entry.send(frame) {
            PushOutcome::Queued => true,
            PushOutcome::Overflowed(evicted) => {
                warn!(
                    connection_id = %id,
                    evicted = evicted.kind(),
                    overflowed = entry.overflow_count(),
                    "Outbound queue full, dropped oldest frame"
                );
                if let ServerMessage::Message { envelope } = evicted {
                    self.transcript.record(TranscriptEvent::Dropped {
                        envelope,
                        reason: DropReason::OutboundOverflow,
                    });
                }
                true
            }
            PushOutcome::Closed => false,
        }
    }

    /// Pushes an envelope to `recipient` and reports it to the transcript.
    pub(super) fn deliver(&self, recipient: &ConnectionId, envelope: Envelope) {
        if self.send_to(recipient, ServerMessage::message(envelope.clone())) {
            self.transcript.record(TranscriptEvent::Delivered {
                envelope,
                recipient: recipient.clone(),
            });
        } else {
            self.transcript.record(TranscriptEvent::Dropped {
                envelope,
                reason: DropReason::RecipientClosed,
            });
        }
    }

    /// Sends the current waiting list to every agent.
    pub(super) fn push_waiting_list(&self, at: Instant) {
        let agents = self.registry.list_by_role(Role::Agent);
        if agents.is_empty() {
            return;
        }
        let sessions = self.sessions.waiting_views(at);
        for agent in &agents {
            self.send_to(
                agent,
                ServerMessage::WaitingList {
                    sessions: sessions.clone(),
                },
            );
        }
    }

    pub(super) fn publish(&self, event: HubEvent) {
        // No subscribers is fine
        let _ = self.event_publisher.send(event);
    }
}
