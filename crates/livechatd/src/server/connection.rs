//! Connection supervisor for a single visitor or agent connection.
//!
//! Each accepted stream gets its own `ConnectionSupervisor` that:
//! - Negotiates the protocol version and authenticates the `connect` frame
//! - Registers the connection with the hub
//! - Runs admission control on every inbound frame before routing it
//! - Drains the connection's outbound queue through a writer task
//! - Unregisters from the hub before the writer is torn down
//!
//! Frames are newline-delimited JSON in both directions.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connection errors are logged and result in graceful disconnect

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use livechat_core::{ConnectionId, Role};
use livechat_protocol::{codes, ClientMessage, MessageType, ProtocolVersion, ServerMessage};

use super::ServerContext;
use crate::admission::{AdmissionController, Decision};
use crate::auth::{ConnectRequest, Identity};
use crate::hub::{HubError, NewConnection};
use crate::outbound::OutboundQueue;

/// Time allowed for the `connect` frame to arrive.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Write timeout (10 seconds)
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

type FrameReader<S> = FramedRead<ReadHalf<S>, LinesCodec>;
type FrameWriter<S> = FramedWrite<WriteHalf<S>, LinesCodec>;

/// Supervisor for one client connection.
pub struct ConnectionSupervisor<S> {
    stream: S,
    ctx: Arc<ServerContext>,
    connection_number: u64,
}

/// State of an admitted connection.
struct Admitted {
    identity: Identity,
    outbound: Arc<OutboundQueue>,
    close: CancellationToken,
    admission: AdmissionController,
    malformed: u32,
}

impl<S> ConnectionSupervisor<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(stream: S, ctx: Arc<ServerContext>, connection_number: u64) -> Self {
        Self {
            stream,
            ctx,
            connection_number,
        }
    }

    /// Runs the connection to completion.
    ///
    /// Returns the connection id if the handshake succeeded.
    pub async fn run(self) -> Option<ConnectionId> {
        let Self {
            stream,
            ctx,
            connection_number,
        } = self;
        debug!(connection = connection_number, "New client connected");

        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(
            read_half,
            LinesCodec::new_with_max_length(ctx.settings.max_frame_bytes),
        );
        let mut writer = FramedWrite::new(write_half, LinesCodec::new());

        let mut conn = match handshake(&ctx, &mut reader, &mut writer).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(connection = connection_number, error = %e, "Handshake failed");
                return None;
            }
        };
        let id = conn.identity.id.clone();
        info!(
            connection_id = %id,
            role = %conn.identity.role,
            "Client handshake completed"
        );

        let writer_task = spawn_writer(writer, Arc::clone(&conn.outbound), conn.close.clone());

        match process_frames(&ctx, &mut conn, &mut reader).await {
            Ok(()) => debug!(connection_id = %id, "Client closed the connection"),
            Err(e) => debug!(connection_id = %id, error = %e, "Connection closed"),
        }

        // Unregister first so the hub stops pushing to a queue nobody drains
        match ctx.hub.unregister(id.clone()).await {
            Ok(_) => {}
            Err(e) => warn!(connection_id = %id, error = %e, "Failed to unregister connection"),
        }
        conn.outbound.close();
        conn.close.cancel();

        let mut writer_task = writer_task;
        if timeout(WRITE_TIMEOUT, &mut writer_task).await.is_err() {
            debug!(connection_id = %id, "Writer did not drain in time");
            writer_task.abort();
        }

        info!(connection_id = %id, "Client disconnected");
        Some(id)
    }
}

/// Reads the `connect` frame, authenticates it, and registers with the hub.
///
/// Failures are answered directly on the writer, since no writer task exists yet.
async fn handshake<S>(
    ctx: &ServerContext,
    reader: &mut FrameReader<S>,
    writer: &mut FrameWriter<S>,
) -> Result<Admitted, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let line = match timeout(HANDSHAKE_TIMEOUT, reader.next()).await {
        Ok(Some(Ok(line))) => line,
        Ok(Some(Err(e))) => return Err(codec_error(e, ctx.settings.max_frame_bytes)),
        Ok(None) => return Err(ConnectionError::Eof),
        Err(_) => return Err(ConnectionError::Timeout),
    };

    let msg: ClientMessage = match serde_json::from_str(&line) {
        Ok(msg) => msg,
        Err(e) => {
            write_frame(
                writer,
                &ServerMessage::error_with_code(
                    format!("Malformed connect frame: {e}"),
                    codes::MALFORMED_ENVELOPE,
                ),
            )
            .await?;
            return Err(ConnectionError::ParseError(e.to_string()));
        }
    };

    if let Err(e) = ProtocolVersion::negotiate(&msg.protocol_version) {
        warn!(
            client_version = %msg.protocol_version,
            server_version = %ProtocolVersion::CURRENT,
            "Protocol version mismatch"
        );
        write_frame(writer, &ServerMessage::rejected(e.to_string())).await?;
        return Err(ConnectionError::VersionMismatch {
            client: msg.protocol_version,
            server: ProtocolVersion::CURRENT,
        });
    }

    let request = match msg.message {
        MessageType::Connect {
            role,
            client_id,
            token,
            display_name,
        } => ConnectRequest {
            role: Some(role),
            client_id,
            token,
            display_name,
        },
        other => {
            write_frame(
                writer,
                &ServerMessage::error_with_code(
                    "Expected connect message for handshake",
                    codes::UNEXPECTED_MESSAGE,
                ),
            )
            .await?;
            return Err(ConnectionError::UnexpectedMessage(format!("{other:?}")));
        }
    };

    let identity = match ctx.authenticator.authenticate(request).await {
        Ok(identity) => identity,
        Err(e) => {
            write_frame(writer, &ServerMessage::rejected(e.to_string())).await?;
            return Err(ConnectionError::Rejected(e.to_string()));
        }
    };

    if ctx.shutdown.is_cancelled() {
        write_frame(writer, &ServerMessage::rejected("Server is shutting down")).await?;
        return Err(ConnectionError::Rejected("server shutting down".to_string()));
    }

    // Cancelled by the hub, which sends `session_closed` first
    let outbound = Arc::new(OutboundQueue::new(ctx.settings.outbound_capacity));
    let close = CancellationToken::new();
    let registration = ctx
        .hub
        .register(NewConnection {
            id: identity.id.clone(),
            role: identity.role,
            display_name: identity.display_name.clone(),
            outbound: Arc::clone(&outbound),
            close: close.clone(),
        })
        .await;

    if let Err(e) = registration {
        write_frame(writer, &ServerMessage::rejected(e.to_string())).await?;
        return Err(ConnectionError::Rejected(e.to_string()));
    }

    Ok(Admitted {
        identity,
        outbound,
        close,
        admission: AdmissionController::new(
            &ctx.settings.admission,
            ctx.global_cap.clone(),
            tokio::time::Instant::now(),
        ),
        malformed: 0,
    })
}

/// Main frame processing loop.
///
/// Returns when the client hangs up, the hub closes the connection, or the
/// connection misbehaves past its limits.
async fn process_frames<S>(
    ctx: &ServerContext,
    conn: &mut Admitted,
    reader: &mut FrameReader<S>,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let read_timeout = ctx.settings.read_timeout;
    let max_frame_bytes = ctx.settings.max_frame_bytes;
    let malformed_threshold = ctx.settings.admission.malformed_threshold;

    loop {
        let next = tokio::select! {
            biased;

            _ = conn.close.cancelled() => return Err(ConnectionError::ForcedClose),
            next = timeout(read_timeout, reader.next()) => next,
        };

        let line = match next {
            Ok(Some(Ok(line))) => line,
            Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                conn.outbound.push(ServerMessage::error_with_code(
                    format!("Frame exceeds {max_frame_bytes} bytes"),
                    codes::MALFORMED_ENVELOPE,
                ));
                return Err(ConnectionError::MessageTooLarge {
                    max: max_frame_bytes,
                });
            }
            Ok(Some(Err(e))) => return Err(codec_error(e, max_frame_bytes)),
            Ok(None) => return Ok(()),
            Err(_) => {
                // A quiet participant in an open session is left to the reaper
                let in_session = ctx
                    .hub
                    .lookup(conn.identity.id.clone())
                    .await
                    .is_some_and(|info| !info.sessions.is_empty());
                if in_session {
                    debug!(connection_id = %conn.identity.id, "Read timeout inside an open session");
                    continue;
                }
                return Err(ConnectionError::Timeout);
            }
        };

        match conn.admission.allow() {
            Decision::Allow => {}
            Decision::Throttle { retry_after } => {
                let retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX);
                conn.outbound.push(ServerMessage::Throttled { retry_after_ms });
                continue;
            }
            Decision::Disconnect => {
                conn.outbound.push(ServerMessage::error_with_code(
                    "Rate limit exceeded, closing connection",
                    codes::RATE_LIMITED,
                ));
                return Err(ConnectionError::RateLimited);
            }
        }

        let msg: ClientMessage = match serde_json::from_str(&line) {
            Ok(msg) => msg,
            Err(e) => {
                conn.note_malformed(format!("Malformed frame: {e}"), malformed_threshold)?;
                continue;
            }
        };
        conn.malformed = 0;

        handle_message(ctx, conn, msg.message).await?;
    }
}

/// Dispatches one parsed client message.
async fn handle_message(
    ctx: &ServerContext,
    conn: &Admitted,
    message: MessageType,
) -> Result<(), ConnectionError> {
    let id = conn.identity.id.clone();
    let reply = match message {
        MessageType::Connect { .. } => Some(ServerMessage::error_with_code(
            "Already connected",
            codes::UNEXPECTED_MESSAGE,
        )),

        MessageType::Text {
            session_id,
            payload,
            client_timestamp,
        } => match ctx.hub.route(id, session_id, payload, client_timestamp).await {
            Ok(outcome) => Some(ServerMessage::Accepted {
                session_id: outcome.session_id().clone(),
                seq: outcome.seq(),
            }),
            Err(HubError::ChannelClosed) => return Err(ConnectionError::HubUnavailable),
            Err(e) => Some(ServerMessage::delivery_failed(
                e.session_id().cloned(),
                e.code(),
                e.to_string(),
            )),
        },

        MessageType::Claim { session_id } => match ctx.hub.claim(id, session_id.clone()).await {
            Ok(()) => None,
            Err(HubError::ChannelClosed) => return Err(ConnectionError::HubUnavailable),
            Err(HubError::ClaimRejected { session_id, reason }) => {
                Some(ServerMessage::ClaimRejected { session_id, reason })
            }
            Err(e) => Some(ServerMessage::ClaimRejected {
                session_id,
                reason: e.to_string(),
            }),
        },

        MessageType::Close { session_id } => match ctx.hub.close_session(id, session_id).await {
            Ok(_) => None,
            Err(HubError::ChannelClosed) => return Err(ConnectionError::HubUnavailable),
            Err(e) => Some(ServerMessage::error_with_code(e.to_string(), e.code())),
        },

        MessageType::ListWaiting => {
            if conn.identity.role == Role::Agent {
                ctx.hub.touch(id).await;
                Some(ServerMessage::WaitingList {
                    sessions: ctx.hub.waiting_sessions().await,
                })
            } else {
                Some(ServerMessage::error_with_code(
                    "Only agents can list waiting sessions",
                    "wrong_role",
                ))
            }
        }

        MessageType::Ping { seq } => {
            ctx.hub.touch(id).await;
            Some(ServerMessage::Pong { seq })
        }
    };

    if let Some(frame) = reply {
        conn.outbound.push(frame);
    }
    Ok(())
}

impl Admitted {
    /// Reports a malformed frame; errors once the streak passes `threshold`.
    fn note_malformed(&mut self, message: String, threshold: u32) -> Result<(), ConnectionError> {
        self.malformed = self.malformed.saturating_add(1);
        self.outbound
            .push(ServerMessage::error_with_code(message, codes::MALFORMED_ENVELOPE));
        if self.malformed > threshold {
            return Err(ConnectionError::TooManyMalformed {
                count: self.malformed,
            });
        }
        Ok(())
    }
}

/// Spawns the task that drains the outbound queue onto the socket.
///
/// A write failure cancels `close` so the read loop stops too.
fn spawn_writer<S>(
    mut writer: FrameWriter<S>,
    outbound: Arc<OutboundQueue>,
    close: CancellationToken,
) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = outbound.pop().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!(error = %e, kind = frame.kind(), "Failed to write frame");
                outbound.close();
                close.cancel();
                return;
            }
        }
        let _ = timeout(WRITE_TIMEOUT, SinkExt::<String>::close(&mut writer)).await;
    })
}

/// Serializes and writes one frame with a timeout.
async fn write_frame<S>(writer: &mut FrameWriter<S>, frame: &ServerMessage) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let json =
        serde_json::to_string(frame).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

    match timeout(WRITE_TIMEOUT, writer.send(json)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

fn codec_error(error: LinesCodecError, max: usize) -> ConnectionError {
    match error {
        LinesCodecError::MaxLineLengthExceeded => ConnectionError::MessageTooLarge { max },
        LinesCodecError::Io(e) => ConnectionError::Io(e.to_string()),
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large (max: {max} bytes)")]
    MessageTooLarge { max: usize },

    #[error("Connection rejected: {0}")]
    Rejected(String),

    #[error("Rate limit violations exceeded threshold")]
    RateLimited,

    #[error("Too many malformed frames in a row ({count})")]
    TooManyMalformed { count: u32 },

    #[error("Closed by the hub")]
    ForcedClose,

    #[error("Hub unavailable")]
    HubUnavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::VersionMismatch {
            client: ProtocolVersion::new(2, 0),
            server: ProtocolVersion::new(1, 0),
        };
        assert!(err.to_string().contains("2.0"));
        assert!(err.to_string().contains("1.0"));
    }

    #[test]
    fn test_codec_error_maps_oversize_frame() {
        let err = codec_error(LinesCodecError::MaxLineLengthExceeded, 4096);
        assert!(matches!(err, ConnectionError::MessageTooLarge { max: 4096 }));
        assert!(err.to_string().contains("4096"));
    }

    #[test]
    fn test_malformed_streak_trips_after_threshold() {
        let mut conn = Admitted {
            identity: Identity {
                id: ConnectionId::new("v1"),
                role: Role::Visitor,
                display_name: None,
            },
            outbound: Arc::new(OutboundQueue::new(8)),
            close: CancellationToken::new(),
            admission: AdmissionController::new(
                &crate::config::AdmissionConfig::default(),
                None,
                tokio::time::Instant::now(),
            ),
            malformed: 0,
        };

        assert!(conn.note_malformed("bad".into(), 2).is_ok());
        assert!(conn.note_malformed("bad".into(), 2).is_ok());
        let err = conn.note_malformed("bad".into(), 2).unwrap_err();
        assert!(matches!(err, ConnectionError::TooManyMalformed { count: 3 }));
        assert_eq!(conn.outbound.len(), 3);
    }
}
