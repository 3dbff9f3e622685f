//! livechat daemon - real-time visitor/agent chat hub
//!
//! This crate provides the engine behind `livechatd`:
//! - `hub` - actor owning the connection registry, sessions and router
//! - `admission` - per-connection token buckets and an optional global cap
//! - `reaper` - closes sessions idle past the configured timeout
//! - `server` - TCP listener and one supervisor task per connection
//! - `auth` - visitor identities and agent JWT verification
//! - `transcript` - sink observing every delivered or dropped message
//! - `monitor` - process and hub load sampling
//! - `config`, `cli` - TOML configuration and the command line
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        livechatd                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌──────────────────┐  commands   ┌──────────────────────┐  │
//! │  │ ChatServer (TCP) │────────────▶│       HubActor       │  │
//! │  │  Supervisors     │◀────────────│ registry + sessions  │  │
//! │  └──────────────────┘  outbound   └──────────┬───────────┘  │
//! │           ▲              queues              │              │
//! │           │ admission                        │ transcript   │
//! │  ┌────────┴─────────┐            ┌───────────▼──────────┐   │
//! │  │ Reaper / Monitor │            │   TranscriptSink     │   │
//! │  └──────────────────┘            └──────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod admission;
pub mod auth;
pub mod cli;
pub mod config;
pub mod hub;
pub mod monitor;
pub mod outbound;
pub mod reaper;
pub mod server;
pub mod transcript;
