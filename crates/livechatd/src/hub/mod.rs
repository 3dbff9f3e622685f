//! Chat hub using the Actor pattern.
//!
//! The hub owns the connection registry, the session table, and the router.
//! Connection supervisors, the reaper, and the monitor talk to it only
//! through a cloned [`HubHandle`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  HubCommand   ┌──────────────────┐  HubEvent  ┌─────────────┐
//! │ Supervisors      │──────────────▶│     HubActor     │───────────▶│ subscribers │
//! │ Reaper, Monitor  │  (mpsc)       │ registry+sessions│ (broadcast)└─────────────┘
//! └──────────────────┘               └────────┬─────────┘
//!          ▲                                  │ ServerMessage
//!          │ writer task pops                 ▼
//!          └──────────────────────── OutboundQueue (per connection)
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - Channel operations handle closure gracefully

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

mod actor;
mod commands;
mod handle;
mod registry;
mod router;
mod sessions;

pub use actor::HubActor;
pub use commands::{
    ConnectionInfo, HubCommand, HubError, HubEvent, HubStats, IdleCandidate, NewConnection,
    Registered, RouteOutcome, RouteRequest,
};
pub use handle::HubHandle;
pub use registry::{ConnectionEntry, ConnectionRegistry};
pub use sessions::SessionTable;

use crate::config::{BroadcastPolicy, Config};
use crate::transcript::TranscriptSink;

const COMMAND_BUFFER: usize = 1024;
const EVENT_BUFFER: usize = 256;

/// Characters of payload shown in awaiting-agent notices.
pub const PREVIEW_CHARS: usize = 80;

/// Routing parameters the hub actor needs.
#[derive(Debug, Clone, PartialEq)]
pub struct HubConfig {
    pub max_connections: usize,
    pub waiting_queue_capacity: usize,
    pub broadcast: BroadcastPolicy,
    pub preview_chars: usize,
}

impl HubConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_connections: config.server.max_connections,
            waiting_queue_capacity: config.session.waiting_queue_capacity,
            broadcast: config.session.broadcast,
            preview_chars: PREVIEW_CHARS,
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Spawns the hub actor and returns a handle to it.
///
/// The actor stops once every handle clone is dropped.
pub fn spawn_hub(config: HubConfig, transcript: Arc<dyn TranscriptSink>) -> HubHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let actor = HubActor::new(cmd_rx, event_tx.clone(), config, transcript);
    tokio::spawn(actor.run());

    HubHandle::new(cmd_tx, event_tx)
}
