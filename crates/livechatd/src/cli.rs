//! Command-line entry point for the livechat daemon.
//!
//! ```bash
//! # Start the daemon (foreground)
//! livechatd start --config /etc/livechat/livechatd.toml
//!
//! # Stop / inspect the running daemon
//! livechatd stop
//! livechatd status
//!
//! # Validate a config file without starting
//! livechatd check-config --config livechatd.toml
//!
//! # Mint an agent token (needs LIVECHAT_JWT_SECRET or auth.jwt_secret)
//! livechatd issue-token alice --name "Alice" --ttl-secs 28800
//!
//! # Enable debug logging
//! RUST_LOG=livechatd=debug livechatd start
//! ```
//!
//! SIGTERM and SIGINT trigger a graceful shutdown: every session is closed
//! with reason `shutdown` before the process exits.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::auth::{Authenticator, JwtAuthenticator};
use crate::config::Config;
use crate::hub::{spawn_hub, HubConfig};
use crate::monitor::spawn_monitor_task;
use crate::reaper::Reaper;
use crate::server::{ChatServer, ConnectionSettings, ServerContext};
use crate::transcript::LogSink;

/// livechat daemon - visitor/agent chat hub
#[derive(Parser, Debug)]
#[command(name = "livechatd", version, about)]
pub struct Args {
    /// Config file (defaults to $LIVECHAT_CONFIG, then built-in defaults)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Start the daemon in the foreground
    Start,
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
    /// Load and validate the configuration, then exit
    CheckConfig,
    /// Print a signed agent token
    IssueToken {
        /// Agent login name; the connection id becomes `agent-<name>`
        sub: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value_t = 8 * 3600)]
        ttl_secs: u64,
    },
}

/// Parses the command line and runs the selected command.
pub fn run() -> Result<()> {
    run_with(Args::parse())
}

pub fn run_with(args: Args) -> Result<()> {
    init_tracing()?;

    // Default to 'start' if no subcommand given
    let command = args.command.unwrap_or(Command::Start);
    let config_path = args.config.as_deref();

    match command {
        Command::Start => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'livechatd stop' to stop it first.");
                process::exit(1);
            }

            let config = Config::load(config_path).context("Failed to load configuration")?;
            write_pid()?;
            let result = run_daemon(config);
            remove_pid_file();
            result
        }
        Command::Stop => {
            let Some(pid) = is_daemon_running() else {
                println!("Daemon is not running.");
                return Ok(());
            };
            println!("Stopping daemon (PID {pid})...");
            stop_daemon(pid)?;

            // Wait for process to exit (up to 5 seconds)
            for _ in 0..50 {
                if !is_process_running(pid) {
                    println!("Daemon stopped.");
                    return Ok(());
                }
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            eprintln!("Daemon did not stop within 5 seconds.");
            process::exit(1);
        }
        Command::Status => {
            let Some(pid) = is_daemon_running() else {
                println!("Daemon is not running.");
                process::exit(1);
            };
            println!("Daemon is running (PID {pid})");
            if let Ok(config) = Config::load(config_path) {
                println!("Listening on: {}", config.server.listen);
            }
            Ok(())
        }
        Command::CheckConfig => {
            let config = Config::load(config_path).context("Invalid configuration")?;
            println!("Configuration OK");
            println!("  listen:            {}", config.server.listen);
            println!("  idle timeout:      {}s", config.session.idle_timeout_secs);
            println!(
                "  admission:         bucket {} refill {}/s threshold {}",
                config.admission.bucket_size,
                config.admission.refill_per_sec,
                config.admission.violation_threshold
            );
            println!(
                "  agent auth:        {}",
                if config.auth.jwt_secret.is_empty() { "disabled" } else { "jwt" }
            );
            Ok(())
        }
        Command::IssueToken {
            sub,
            name,
            ttl_secs,
        } => {
            let config = Config::load(config_path).context("Failed to load configuration")?;
            let auth = JwtAuthenticator::new(config.auth.jwt_secret);
            let token = auth
                .issue_token(&sub, name.as_deref(), ttl_secs)
                .context("Failed to issue token")?;
            println!("{token}");
            Ok(())
        }
    }
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("livechatd=info".parse()?)
        .add_directive("livechat_core=info".parse()?)
        .add_directive("livechat_protocol=info".parse()?);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;
    Ok(())
}

/// Returns the path to the PID file.
pub fn pid_file_path() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("livechat")
        .join("livechatd.pid")
}

fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

/// Returns the daemon's pid, clearing a stale pid file.
fn is_daemon_running() -> Option<u32> {
    let pid = read_pid()?;
    if is_process_running(pid) {
        return Some(pid);
    }
    remove_pid_file();
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let pid = i32::try_from(pid).context("PID out of range")?;
        let result = unsafe { libc::kill(pid, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {pid}");
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

/// Runs the daemon until a shutdown signal arrives.
#[tokio::main]
async fn run_daemon(config: Config) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        listen = %config.server.listen,
        "livechat daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let hub = spawn_hub(HubConfig::from_config(&config), Arc::new(LogSink));
    info!("Chat hub started");

    let mut reaper = Reaper::new(
        hub.clone(),
        config.session.idle_timeout(),
        config.session.reaper_interval(),
    );
    reaper.start();

    let _monitor_handle =
        spawn_monitor_task(hub.clone(), config.monitor.clone(), cancel_token.clone());

    let authenticator: Arc<dyn Authenticator> =
        Arc::new(JwtAuthenticator::new(config.auth.jwt_secret.clone()));
    let ctx = ServerContext::new(
        hub,
        authenticator,
        ConnectionSettings::from_config(&config),
        cancel_token,
    );
    let server = ChatServer::bind(config.listen_addr()?, ctx).await?;

    let result = server.run().await;
    reaper.stop().await;

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!(accepted = server.accepted(), "livechat daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_subcommand_defaults_to_start() {
        let args = Args::try_parse_from(["livechatd"]).unwrap();
        assert!(args.command.is_none());
        assert!(args.config.is_none());
    }

    #[test]
    fn test_global_config_flag() {
        let args =
            Args::try_parse_from(["livechatd", "check-config", "--config", "/tmp/lc.toml"]).unwrap();
        assert_eq!(args.command, Some(Command::CheckConfig));
        assert_eq!(args.config, Some(PathBuf::from("/tmp/lc.toml")));
    }

    #[test]
    fn test_issue_token_args() {
        let args = Args::try_parse_from(["livechatd", "issue-token", "alice", "--ttl-secs", "60"])
            .unwrap();
        assert_eq!(
            args.command,
            Some(Command::IssueToken {
                sub: "alice".to_string(),
                name: None,
                ttl_secs: 60,
            })
        );
    }

    #[test]
    fn test_pid_file_lives_under_livechat_dir() {
        let path = pid_file_path();
        assert!(path.ends_with("livechat/livechatd.pid"));
    }
}
