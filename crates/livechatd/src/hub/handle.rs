//! Client interface for the HubActor.
//!
//! `HubHandle` is cheap to clone and shared by every connection supervisor,
//! the reaper and the monitor. Actor shutdown surfaces as
//! `HubError::ChannelClosed` (or an empty/`None` answer for queries).

use livechat_core::{ConnectionId, Role, SessionId, SessionView};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Duration, Instant};

use super::commands::{
    ConnectionInfo, HubCommand, HubError, HubEvent, HubStats, IdleCandidate, NewConnection,
    Registered, RouteOutcome, RouteRequest,
};

#[derive(Clone)]
pub struct HubHandle {
    sender: mpsc::Sender<HubCommand>,
    event_sender: broadcast::Sender<HubEvent>,
}

impl HubHandle {
    pub fn new(sender: mpsc::Sender<HubCommand>, event_sender: broadcast::Sender<HubEvent>) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> HubCommand,
    ) -> Result<T, HubError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| HubError::ChannelClosed)?;
        rx.await.map_err(|_| HubError::ChannelClosed)
    }

    /// Registers a connection. A visitor gets a new `Waiting` session.
    ///
    /// # Errors
    ///
    /// - `HubError::DuplicateIdentity` if the id is already registered
    /// - `HubError::HubFull` at `max_connections`
    /// - `HubError::ChannelClosed` if the actor has shut down
    pub async fn register(&self, connection: NewConnection) -> Result<Registered, HubError> {
        let at = Instant::now();
        self.request(|respond_to| HubCommand::Register {
            connection,
            at,
            respond_to,
        })
        .await?
    }

    /// Unregisters a connection, closing its sessions.
    ///
    /// Returns false for ids that were not registered.
    pub async fn unregister(&self, id: ConnectionId) -> Result<bool, HubError> {
        let at = Instant::now();
        self.request(|respond_to| HubCommand::Unregister { id, at, respond_to })
            .await
    }

    pub async fn lookup(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        let at = Instant::now();
        self.request(|respond_to| HubCommand::Lookup { id, at, respond_to })
            .await
            .ok()
            .flatten()
    }

    pub async fn list_by_role(&self, role: Role) -> Vec<ConnectionId> {
        self.request(|respond_to| HubCommand::ListByRole { role, respond_to })
            .await
            .unwrap_or_default()
    }

    /// Routes chat text from `sender`.
    ///
    /// # Errors
    ///
    /// - `HubError::RecipientNotFound` for an unknown or closed session
    /// - `HubError::NotAssigned` if an agent addresses someone else's session
    /// - `HubError::RegistryInconsistency` if the counterpart vanished
    pub async fn route(
        &self,
        sender: ConnectionId,
        session_id: Option<SessionId>,
        payload: String,
        client_timestamp: Option<i64>,
    ) -> Result<RouteOutcome, HubError> {
        let request = RouteRequest {
            sender,
            session_id,
            payload,
            client_timestamp,
            at: Instant::now(),
        };
        self.request(|respond_to| HubCommand::Route {
            request,
            respond_to,
        })
        .await?
    }

    /// Claims a waiting session for `agent`. The first claim wins.
    ///
    /// # Errors
    ///
    /// - `HubError::ClaimRejected` if another agent got there first
    /// - `HubError::RecipientNotFound` if the session is gone
    pub async fn claim(&self, agent: ConnectionId, session_id: SessionId) -> Result<(), HubError> {
        let at = Instant::now();
        self.request(|respond_to| HubCommand::Claim {
            agent,
            session_id,
            at,
            respond_to,
        })
        .await?
    }

    /// Ends a session on behalf of one of its participants.
    pub async fn close_session(
        &self,
        requester: ConnectionId,
        session_id: Option<SessionId>,
    ) -> Result<SessionId, HubError> {
        let at = Instant::now();
        self.request(|respond_to| HubCommand::CloseSession {
            requester,
            session_id,
            at,
            respond_to,
        })
        .await?
    }

    /// Records activity on a connection. Fire-and-forget.
    pub async fn touch(&self, id: ConnectionId) {
        let _ = self
            .sender
            .send(HubCommand::Touch {
                id,
                at: Instant::now(),
            })
            .await;
    }

    pub async fn waiting_sessions(&self) -> Vec<SessionView> {
        let at = Instant::now();
        self.request(|respond_to| HubCommand::WaitingSessions { at, respond_to })
            .await
            .unwrap_or_default()
    }

    pub async fn get_session(&self, session_id: SessionId) -> Option<SessionView> {
        let at = Instant::now();
        self.request(|respond_to| HubCommand::GetSession {
            session_id,
            at,
            respond_to,
        })
        .await
        .ok()
        .flatten()
    }

    pub async fn idle_sessions(
        &self,
        now: Instant,
        idle_timeout: Duration,
    ) -> Result<Vec<IdleCandidate>, HubError> {
        self.request(|respond_to| HubCommand::IdleSessions {
            now,
            idle_timeout,
            respond_to,
        })
        .await
    }

    /// Asks the hub to close `candidate` if it is still idle.
    pub async fn expire_session(
        &self,
        candidate: IdleCandidate,
        idle_timeout: Duration,
        now: Instant,
    ) -> Result<bool, HubError> {
        self.request(|respond_to| HubCommand::ExpireSession {
            candidate,
            idle_timeout,
            now,
            respond_to,
        })
        .await
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        self.request(|respond_to| HubCommand::Stats { respond_to })
            .await
    }

    /// Closes every session and connection. Returns how many connections
    /// outlived their sessions and were closed directly.
    pub async fn shutdown(&self) -> Result<usize, HubError> {
        let at = Instant::now();
        self.request(|respond_to| HubCommand::Shutdown { at, respond_to })
            .await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.event_sender.subscribe()
    }

    /// Returns true if the actor is still running.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}
