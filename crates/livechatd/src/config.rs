//! Daemon configuration.
//!
//! Loaded from TOML, then overridden from the environment:
//! - `LIVECHAT_CONFIG`: path of the TOML file
//! - `LIVECHAT_LISTEN`: listen address
//! - `LIVECHAT_JWT_SECRET`: HS256 secret for agent tokens
//!
//! Every section is optional; missing keys take the defaults below.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const CONFIG_ENV: &str = "LIVECHAT_CONFIG";
pub const LISTEN_ENV: &str = "LIVECHAT_LISTEN";
pub const JWT_SECRET_ENV: &str = "LIVECHAT_JWT_SECRET";

/// Default listen address (same port the widget has always used).
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8081";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub admission: AdmissionConfig,
    pub connection: ConnectionConfig,
    pub auth: AuthConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// A connection silent for this long is closed
    pub read_timeout_secs: u64,
    pub max_frame_bytes: usize,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            read_timeout_secs: 300,
            max_frame_bytes: 64 * 1024,
            max_connections: 10_000,
        }
    }
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

/// Which agents hear about a waiting visitor's messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastPolicy {
    #[default]
    AllAgents,
    /// Only agents that currently own no session
    IdleAgents,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub idle_timeout_secs: u64,
    pub reaper_interval_secs: u64,
    /// Messages held per waiting session before the oldest is dropped
    pub waiting_queue_capacity: usize,
    pub broadcast: BroadcastPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 600,
            reaper_interval_secs: 10,
            waiting_queue_capacity: 50,
            broadcast: BroadcastPolicy::AllAgents,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub bucket_size: u32,
    pub refill_per_sec: f64,
    /// Rejections tolerated before a forced disconnect. The count resets only
    /// once a full bucket window passes without a rejection.
    pub violation_threshold: u32,
    /// Messages per second across all connections, 0 disables
    pub global_per_sec: u32,
    /// Consecutive malformed frames tolerated before closing
    pub malformed_threshold: u32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            bucket_size: 10,
            refill_per_sec: 5.0,
            violation_threshold: 20,
            global_per_sec: 0,
            malformed_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub outbound_queue_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 256,
        }
    }
}

/// Thresholds for the periodic load monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    pub memory_threshold_mb: u64,
    pub cpu_threshold_percent: f32,
    /// Waiting sessions above this count are reported as a backlog
    pub waiting_backlog: usize,
    /// Waiting sessions per connected agent above this are reported
    pub waiting_per_agent: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            memory_threshold_mb: 512,
            cpu_threshold_percent: 80.0,
            waiting_backlog: 25,
            waiting_per_agent: 5,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &if self.jwt_secret.is_empty() { "<unset>" } else { "<redacted>" })
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {field} {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

impl Config {
    /// Loads configuration from `path`, or `$LIVECHAT_CONFIG`, or defaults,
    /// then applies environment overrides and validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => {
                debug!(path = %path.display(), "Loading config file");
                let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Applies overrides from `lookup` (the process environment in production).
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(listen) = lookup(LISTEN_ENV).filter(|v| !v.is_empty()) {
            self.server.listen = listen;
        }
        if let Some(secret) = lookup(JWT_SECRET_ENV).filter(|v| !v.is_empty()) {
            self.auth.jwt_secret = secret;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;
        if self.server.max_frame_bytes == 0 {
            return Err(ConfigError::invalid("server.max_frame_bytes", "must be > 0"));
        }
        if self.server.max_connections == 0 {
            return Err(ConfigError::invalid("server.max_connections", "must be > 0"));
        }
        if self.server.read_timeout_secs == 0 {
            return Err(ConfigError::invalid("server.read_timeout_secs", "must be > 0"));
        }
        if self.session.idle_timeout_secs == 0 {
            return Err(ConfigError::invalid("session.idle_timeout_secs", "must be > 0"));
        }
        if self.session.reaper_interval_secs == 0 {
            return Err(ConfigError::invalid("session.reaper_interval_secs", "must be > 0"));
        }
        if self.session.waiting_queue_capacity == 0 {
            return Err(ConfigError::invalid("session.waiting_queue_capacity", "must be > 0"));
        }
        if self.admission.bucket_size == 0 {
            return Err(ConfigError::invalid("admission.bucket_size", "must be > 0"));
        }
        if !(self.admission.refill_per_sec.is_finite() && self.admission.refill_per_sec > 0.0) {
            return Err(ConfigError::invalid(
                "admission.refill_per_sec",
                "must be a positive number",
            ));
        }
        if self.connection.outbound_queue_capacity == 0 {
            return Err(ConfigError::invalid(
                "connection.outbound_queue_capacity",
                "must be > 0",
            ));
        }
        if self.monitor.interval_secs == 0 {
            return Err(ConfigError::invalid("monitor.interval_secs", "must be > 0"));
        }
        if self.auth.jwt_secret.is_empty() {
            warn!("No JWT secret configured; agent connections will be rejected");
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .listen
            .parse()
            .map_err(|e| ConfigError::invalid("server.listen", format!("{e}")))
    }
}
