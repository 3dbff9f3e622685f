//! TCP server for the chat hub.
//!
//! The server:
//! - Listens on a TCP socket for visitor and agent connections
//! - Spawns a ConnectionSupervisor for each client
//! - Shuts the hub down, and with it every connection, on cancellation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   ChatServer    │
//! │                 │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌──────────────────────┐     ┌─────────────────┐
//! │ ConnectionSupervisor │────▶│    HubHandle    │
//! │     (per client)     │◀────│  OutboundQueue  │
//! └──────────────────────┘     └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept errors are logged and allow continued operation

mod connection;

pub use connection::{ConnectionError, ConnectionSupervisor, HANDSHAKE_TIMEOUT, WRITE_TIMEOUT};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admission::GlobalCap;
use crate::auth::Authenticator;
use crate::config::{AdmissionConfig, Config};
use crate::hub::HubHandle;

/// Per-connection limits derived from [`Config`].
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub read_timeout: Duration,
    pub max_frame_bytes: usize,
    pub outbound_capacity: usize,
    pub admission: AdmissionConfig,
}

impl ConnectionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            read_timeout: config.server.read_timeout(),
            max_frame_bytes: config.server.max_frame_bytes,
            outbound_capacity: config.connection.outbound_queue_capacity,
            admission: config.admission.clone(),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Everything a connection supervisor shares with its siblings.
pub struct ServerContext {
    pub hub: HubHandle,
    pub authenticator: Arc<dyn Authenticator>,
    pub settings: ConnectionSettings,
    /// Process-wide message cap, if configured
    pub global_cap: Option<Arc<GlobalCap>>,
    /// Stops the accept loop. Open connections are closed through the hub.
    pub shutdown: CancellationToken,
}

impl ServerContext {
    pub fn new(
        hub: HubHandle,
        authenticator: Arc<dyn Authenticator>,
        settings: ConnectionSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let global_cap = GlobalCap::new(settings.admission.global_per_sec);
        Self {
            hub,
            authenticator,
            settings,
            global_cap,
            shutdown,
        }
    }
}

/// TCP server accepting chat connections.
pub struct ChatServer {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    connection_counter: AtomicU64,
}

impl ChatServer {
    /// Binds the listening socket. Port 0 picks a free port.
    pub async fn bind(addr: SocketAddr, ctx: ServerContext) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr,
                error: e.to_string(),
            })?;
        Ok(Self {
            listener,
            ctx: Arc::new(ctx),
            connection_counter: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener.local_addr().map_err(|e| ServerError::Io(e.to_string()))
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Returns how many connections have been accepted so far.
    pub fn accepted(&self) -> u64 {
        self.connection_counter.load(Ordering::Relaxed)
    }

    /// Runs the server.
    ///
    /// Accepts connections until the context's shutdown token is cancelled,
    /// then shuts the hub down. Does not return until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let cancel_token = self.ctx.shutdown.clone();
        info!(addr = %self.local_addr()?, "Chat server listening");

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                            }
                            let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            debug!(peer = %peer, connection = conn_num, "Accepted connection");
                            self.handle_connection(stream, conn_num);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        self.cleanup().await;
        Ok(())
    }

    fn handle_connection(&self, stream: tokio::net::TcpStream, connection_number: u64) {
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            ConnectionSupervisor::new(stream, ctx, connection_number)
                .run()
                .await;
        });
    }

    /// Closes every session and connection through the hub.
    async fn cleanup(&self) {
        match self.ctx.hub.shutdown().await {
            Ok(closed) => info!(connections_closed = closed, "Server cleanup complete"),
            Err(e) => warn!(error = %e, "Hub already stopped during cleanup"),
        }
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: SocketAddr, error: String },

    #[error("I/O error: {0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_display() {
        let err = ServerError::Bind {
            addr: "127.0.0.1:8081".parse().unwrap(),
            error: "address in use".to_string(),
        };
        assert!(err.to_string().contains("127.0.0.1:8081"));
        assert!(err.to_string().contains("address in use"));
    }

    #[test]
    fn test_settings_follow_config() {
        let mut config = Config::default();
        config.server.max_frame_bytes = 1024;
        config.connection.outbound_queue_capacity = 8;
        let settings = ConnectionSettings::from_config(&config);
        assert_eq!(settings.max_frame_bytes, 1024);
        assert_eq!(settings.outbound_capacity, 8);
        assert_eq!(settings.read_timeout, config.server.read_timeout());
    }
}
