//! Session expiry reaper.
//!
//! Periodically closes sessions idle for longer than the configured timeout.
//! A sweep is optimistic: it takes a snapshot of idle candidates, then asks
//! the hub to expire each one. The hub re-checks the candidate's activity
//! before closing, so a message arriving mid-sweep always wins.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hub::{HubError, HubHandle};

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions that looked idle in the snapshot
    pub candidates: usize,
    pub expired: usize,
}

pub struct Reaper {
    hub: HubHandle,
    idle_timeout: Duration,
    sweep_interval: Duration,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Reaper {
    pub fn new(hub: HubHandle, idle_timeout: Duration, sweep_interval: Duration) -> Self {
        Self {
            hub,
            idle_timeout,
            sweep_interval,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Starts periodic sweeping. Calling it twice is a no-op.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        self.cancel = CancellationToken::new();
        let hub = self.hub.clone();
        let idle_timeout = self.idle_timeout;
        let sweep_interval = self.sweep_interval;
        let cancel = self.cancel.clone();

        self.task = Some(tokio::spawn(async move {
            info!(
                idle_timeout_secs = idle_timeout.as_secs(),
                interval_secs = sweep_interval.as_secs(),
                "Reaper started"
            );
            let mut ticker = interval(sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match sweep(&hub, idle_timeout, Instant::now()).await {
                            Ok(report) if report.expired > 0 => {
                                info!(expired = report.expired, candidates = report.candidates, "Reaper sweep");
                            }
                            Ok(_) => {}
                            Err(HubError::ChannelClosed) => {
                                debug!("Reaper stopping: hub channel closed");
                                break;
                            }
                            Err(e) => warn!(error = %e, "Reaper sweep failed"),
                        }
                    }
                }
            }
            info!("Reaper stopped");
        }));
    }

    /// Stops sweeping and waits for the task to finish.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Runs one sweep as of `now`.
    pub async fn sweep_at(&self, now: Instant) -> Result<SweepReport, HubError> {
        sweep(&self.hub, self.idle_timeout, now).await
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn sweep(hub: &HubHandle, idle_timeout: Duration, now: Instant) -> Result<SweepReport, HubError> {
    let candidates = hub.idle_sessions(now, idle_timeout).await?;
    let mut report = SweepReport {
        candidates: candidates.len(),
        expired: 0,
    };
    for candidate in candidates {
        let session_id = candidate.session_id.clone();
        if hub.expire_session(candidate, idle_timeout, now).await? {
            debug!(session_id = %session_id, "Expired idle session");
            report.expired += 1;
        }
    }
    Ok(report)
}
