//! Load monitoring for livechatd.
//!
//! Every `monitor.interval_secs` the monitor takes a [`LoadSample`]: the
//! daemon's own memory and CPU plus the hub's connection and session counts,
//! with routed messages and outbound overflows as deltas since the previous
//! sample. Each sample is checked against [`MonitorConfig`] and every
//! [`LoadAlert`] it raises is logged as a warning.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A process missing from `sysinfo` reads as zero usage

use std::process;

use sysinfo::{Pid, System};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::hub::{HubError, HubHandle, HubStats};

/// Memory and CPU of the daemon process.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessUsage {
    pub memory_mb: u64,
    /// Percentage of one core; can exceed 100 on multi-threaded runtimes
    pub cpu_percent: f32,
}

/// Reads [`ProcessUsage`] for the current process.
pub struct ProcessProbe {
    system: System,
    pid: Pid,
}

impl ProcessProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(process::id()),
        }
    }

    /// CPU is measured against the previous call, so the first reading is 0.
    pub fn sample(&mut self) -> ProcessUsage {
        // refresh_all() is required for CPU calculation to work
        self.system.refresh_all();
        self.system
            .process(self.pid)
            .map(|p| ProcessUsage {
                memory_mb: p.memory() / 1024 / 1024,
                cpu_percent: p.cpu_usage(),
            })
            .unwrap_or_default()
    }
}

impl Default for ProcessProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Hub counters between two samples.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubLoad {
    pub visitors: usize,
    pub agents: usize,
    pub waiting_sessions: usize,
    pub active_sessions: usize,
    pub messages_routed: u64,
    pub sessions_closed: u64,
    pub outbound_overflows: u64,
}

impl HubLoad {
    /// Builds the delta from `previous` to `current`. Gauges are taken as-is.
    pub fn between(previous: &HubStats, current: &HubStats) -> Self {
        Self {
            visitors: current.visitors,
            agents: current.agents,
            waiting_sessions: current.waiting_sessions,
            active_sessions: current.active_sessions,
            messages_routed: current.messages_routed.saturating_sub(previous.messages_routed),
            sessions_closed: current.sessions_closed.saturating_sub(previous.sessions_closed),
            outbound_overflows: current
                .outbound_overflows
                .saturating_sub(previous.outbound_overflows),
        }
    }
}

/// Something in a sample worth a warning.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadAlert {
    HighMemory { memory_mb: u64, threshold_mb: u64 },
    HighCpu { cpu_percent: f32, threshold_percent: f32 },
    /// Too many visitors waiting overall
    WaitingBacklog { waiting: usize, threshold: usize },
    /// Visitors are waiting and no agent is connected
    NoAgents { waiting: usize },
    /// Connected agents cannot keep up with the queue
    AgentsOverloaded { waiting: usize, agents: usize },
    /// Slow consumers lost frames since the previous sample
    OutboundOverflow { dropped: u64 },
}

/// One monitor tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadSample {
    pub process: ProcessUsage,
    pub hub: HubLoad,
}

impl LoadSample {
    /// Checks the sample against `limits`.
    pub fn alerts(&self, limits: &MonitorConfig) -> Vec<LoadAlert> {
        let mut alerts = Vec::new();
        let process = self.process;
        if process.memory_mb > limits.memory_threshold_mb {
            alerts.push(LoadAlert::HighMemory {
                memory_mb: process.memory_mb,
                threshold_mb: limits.memory_threshold_mb,
            });
        }
        if process.cpu_percent > limits.cpu_threshold_percent {
            alerts.push(LoadAlert::HighCpu {
                cpu_percent: process.cpu_percent,
                threshold_percent: limits.cpu_threshold_percent,
            });
        }

        let hub = &self.hub;
        if hub.waiting_sessions > limits.waiting_backlog {
            alerts.push(LoadAlert::WaitingBacklog {
                waiting: hub.waiting_sessions,
                threshold: limits.waiting_backlog,
            });
        }
        if hub.waiting_sessions > 0 && hub.agents == 0 {
            alerts.push(LoadAlert::NoAgents {
                waiting: hub.waiting_sessions,
            });
        } else if hub.agents > 0
            && hub.waiting_sessions > hub.agents.saturating_mul(limits.waiting_per_agent)
        {
            alerts.push(LoadAlert::AgentsOverloaded {
                waiting: hub.waiting_sessions,
                agents: hub.agents,
            });
        }
        if hub.outbound_overflows > 0 {
            alerts.push(LoadAlert::OutboundOverflow {
                dropped: hub.outbound_overflows,
            });
        }
        alerts
    }
}

/// Spawns the load monitor.
///
/// Stops when `cancel_token` fires or the hub goes away.
pub fn spawn_monitor_task(
    hub: HubHandle,
    limits: MonitorConfig,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut probe = ProcessProbe::new();
        let mut tick = interval(limits.interval());
        let mut previous = HubStats::default();

        // Baseline for the first CPU reading
        let _ = probe.sample();
        tick.tick().await;

        info!(
            interval_secs = limits.interval_secs,
            memory_threshold_mb = limits.memory_threshold_mb,
            cpu_threshold_percent = limits.cpu_threshold_percent,
            waiting_backlog = limits.waiting_backlog,
            "Load monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    info!("Load monitor shutting down");
                    break;
                }

                _ = tick.tick() => {
                    let stats = match hub.stats().await {
                        Ok(stats) => stats,
                        Err(HubError::ChannelClosed) => {
                            debug!("Hub stopped; monitor exiting");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to read hub stats");
                            continue;
                        }
                    };
                    let sample = LoadSample {
                        process: probe.sample(),
                        hub: HubLoad::between(&previous, &stats),
                    };
                    previous = stats;
                    log_sample(&sample, &limits);
                }
            }
        }

        debug!("Load monitor task completed");
    })
}

fn log_sample(sample: &LoadSample, limits: &MonitorConfig) {
    for alert in sample.alerts(limits) {
        match alert {
            LoadAlert::HighMemory { memory_mb, threshold_mb } => {
                warn!(memory_mb, threshold_mb, "HIGH MEMORY: daemon memory above threshold");
            }
            LoadAlert::HighCpu { cpu_percent, threshold_percent } => warn!(
                cpu_percent = format!("{cpu_percent:.1}"),
                threshold_percent,
                "HIGH CPU: daemon CPU above threshold"
            ),
            LoadAlert::WaitingBacklog { waiting, threshold } => {
                warn!(waiting, threshold, "Waiting-session backlog");
            }
            LoadAlert::NoAgents { waiting } => {
                warn!(waiting, "Visitors waiting with no agent connected");
            }
            LoadAlert::AgentsOverloaded { waiting, agents } => {
                warn!(waiting, agents, "Agents are not keeping up with the queue");
            }
            LoadAlert::OutboundOverflow { dropped } => {
                warn!(dropped, "Slow consumers dropped outbound frames");
            }
        }
    }

    let hub = &sample.hub;
    info!(
        visitors = hub.visitors,
        agents = hub.agents,
        waiting = hub.waiting_sessions,
        active = hub.active_sessions,
        routed = hub.messages_routed,
        closed = hub.sessions_closed,
        memory_mb = sample.process.memory_mb,
        cpu_percent = format!("{:.1}", sample.process.cpu_percent),
        "Hub load"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn stats(agents: usize, waiting: usize, routed: u64, overflows: u64) -> HubStats {
        HubStats {
            visitors: waiting + 1,
            agents,
            waiting_sessions: waiting,
            active_sessions: 1,
            messages_routed: routed,
            sessions_closed: 0,
            outbound_overflows: overflows,
        }
    }

    fn hub_sample(agents: usize, waiting: usize) -> LoadSample {
        LoadSample {
            process: ProcessUsage::default(),
            hub: HubLoad::between(&HubStats::default(), &stats(agents, waiting, 0, 0)),
        }
    }

    #[test]
    fn test_quiet_sample_raises_nothing() {
        assert!(hub_sample(2, 3).alerts(&MonitorConfig::default()).is_empty());
    }

    #[test]
    fn test_process_thresholds_come_from_config() {
        let limits = MonitorConfig {
            memory_threshold_mb: 100,
            cpu_threshold_percent: 50.0,
            ..MonitorConfig::default()
        };
        let sample = LoadSample {
            process: ProcessUsage {
                memory_mb: 150,
                cpu_percent: 75.0,
            },
            hub: HubLoad::default(),
        };
        let alerts = sample.alerts(&limits);
        assert!(alerts.contains(&LoadAlert::HighMemory {
            memory_mb: 150,
            threshold_mb: 100
        }));
        assert!(alerts.iter().any(|a| matches!(a, LoadAlert::HighCpu { .. })));
        assert!(sample.alerts(&MonitorConfig::default()).is_empty());
    }

    #[test]
    fn test_waiting_without_agents() {
        let alerts = hub_sample(0, 2).alerts(&MonitorConfig::default());
        assert_eq!(alerts, vec![LoadAlert::NoAgents { waiting: 2 }]);
    }

    #[test]
    fn test_agents_overloaded_and_backlog() {
        let limits = MonitorConfig {
            waiting_backlog: 8,
            waiting_per_agent: 4,
            ..MonitorConfig::default()
        };
        let alerts = hub_sample(2, 9).alerts(&limits);
        assert!(alerts.contains(&LoadAlert::WaitingBacklog {
            waiting: 9,
            threshold: 8
        }));
        assert!(alerts.contains(&LoadAlert::AgentsOverloaded {
            waiting: 9,
            agents: 2
        }));
        assert!(hub_sample(3, 8).alerts(&limits).is_empty());
    }

    #[test]
    fn test_hub_load_counts_deltas() {
        let load = HubLoad::between(&stats(1, 2, 10, 1), &stats(1, 4, 25, 1));
        assert_eq!(load.messages_routed, 15);
        assert_eq!(load.outbound_overflows, 0);
        assert_eq!(load.waiting_sessions, 4);
    }

    #[test]
    fn test_overflow_delta_alerts() {
        let sample = LoadSample {
            process: ProcessUsage::default(),
            hub: HubLoad::between(&stats(1, 0, 0, 2), &stats(1, 0, 0, 7)),
        };
        assert_eq!(
            sample.alerts(&MonitorConfig::default()),
            vec![LoadAlert::OutboundOverflow { dropped: 5 }]
        );
    }

    #[test]
    fn test_probe_reads_own_process() {
        let mut probe = ProcessProbe::new();
        let usage = probe.sample();
        assert!(usage.memory_mb > 0);
    }

    #[tokio::test]
    async fn test_monitor_exits_on_cancel() {
        let hub = crate::hub::spawn_hub(
            crate::hub::HubConfig::default(),
            std::sync::Arc::new(crate::transcript::NullSink),
        );
        let limits = MonitorConfig {
            interval_secs: 1,
            ..MonitorConfig::default()
        };
        let cancel = CancellationToken::new();
        let task = spawn_monitor_task(hub.clone(), limits, cancel.clone());
        cancel.cancel();
        assert!(tokio::time::timeout(Duration::from_secs(2), task).await.is_ok());
    }
}
