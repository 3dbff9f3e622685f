//! Bounded per-connection outbound queue.
//!
//! The hub pushes, the connection's writer task pops. Pushing never blocks:
//! when the queue is full the oldest unsent frame is dropped and the overflow
//! counter increments, so one slow client cannot stall routing for everyone.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use livechat_protocol::ServerMessage;
use tokio::sync::Notify;

/// Result of [`OutboundQueue::push`].
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest frame, which is returned
    Overflowed(ServerMessage),
    /// The connection is shutting down; the frame was discarded
    Closed,
}

#[derive(Debug, Default)]
struct Inner {
    frames: VecDeque<ServerMessage>,
    closed: bool,
}

#[derive(Debug)]
pub struct OutboundQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    overflowed: AtomicU64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            overflowed: AtomicU64::new(0),
        }
    }

    // Critical sections never panic, but a poisoned lock must not take the
    // writer down with it.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, frame: ServerMessage) -> PushOutcome {
        let outcome = {
            let mut inner = self.lock();
            if inner.closed {
                return PushOutcome::Closed;
            }
            let evicted = if inner.frames.len() >= self.capacity {
                inner.frames.pop_front()
            } else {
                None
            };
            inner.frames.push_back(frame);
            evicted
        };
        self.notify.notify_one();
        match outcome {
            Some(evicted) => {
                self.overflowed.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Overflowed(evicted)
            }
            None => PushOutcome::Queued,
        }
    }

    /// Waits for the next frame. Returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<ServerMessage> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                if let Some(frame) = inner.frames.pop_front() {
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stops accepting frames; already queued frames can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames dropped because the queue was full.
    pub fn overflow_count(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }
}
