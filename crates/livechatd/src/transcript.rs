//! Transcript collaborator.
//!
//! The hub reports every delivered or dropped envelope here. Recording is
//! fire-and-forget: a sink must never block the hub actor.

use std::fmt;

use livechat_core::{ConnectionId, Envelope};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Why an envelope never reached its recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The waiting queue overflowed before an agent claimed the session
    WaitingQueueFull,
    /// The recipient's outbound queue overflowed
    OutboundOverflow,
    /// The session closed while the message was still held
    SessionClosed,
    /// The recipient connection was already shutting down
    RecipientClosed,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WaitingQueueFull => write!(f, "waiting queue full"),
            Self::OutboundOverflow => write!(f, "outbound queue overflow"),
            Self::SessionClosed => write!(f, "session closed"),
            Self::RecipientClosed => write!(f, "recipient closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    Delivered {
        envelope: Envelope,
        recipient: ConnectionId,
    },
    Dropped {
        envelope: Envelope,
        reason: DropReason,
    },
}

impl TranscriptEvent {
    pub fn envelope(&self) -> &Envelope {
        match self {
            Self::Delivered { envelope, .. } | Self::Dropped { envelope, .. } => envelope,
        }
    }
}

/// Receives transcript events from the hub.
pub trait TranscriptSink: Send + Sync {
    /// Records one event. Must return promptly.
    fn record(&self, event: TranscriptEvent);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TranscriptSink for NullSink {
    fn record(&self, _event: TranscriptEvent) {}
}

/// Writes events to the `livechatd::transcript` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl TranscriptSink for LogSink {
    fn record(&self, event: TranscriptEvent) {
        match event {
            TranscriptEvent::Delivered { envelope, recipient } => debug!(
                target: "livechatd::transcript",
                session_id = %envelope.session_id,
                seq = envelope.seq,
                sender = %envelope.sender,
                recipient = %recipient,
                "delivered"
            ),
            TranscriptEvent::Dropped { envelope, reason } => info!(
                target: "livechatd::transcript",
                session_id = %envelope.session_id,
                seq = envelope.seq,
                sender = %envelope.sender,
                reason = %reason,
                "dropped"
            ),
        }
    }
}

/// Forwards events over an unbounded channel to an external persister.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<TranscriptEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TranscriptEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl TranscriptSink for ChannelSink {
    fn record(&self, event: TranscriptEvent) {
        // Receiver gone means nobody persists transcripts any more
        let _ = self.sender.send(event);
    }
}
