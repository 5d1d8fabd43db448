//! temlink Daemon - instrument bridge and message bus gateway
//!
//! This crate provides the daemon's building blocks:
//! - `hardware` - the instrument control surface, a simulator and a test double
//! - `bridge` - command handlers, motion tracking, status publication and
//!   the control loop, serialized by one lock
//! - `bus` - the in-process message bus and the command router
//! - `server` - Unix socket gateway exposing the bus to clients
//! - `config` - TOML/env configuration
//! - `daemon` - wiring of all of the above
//! - `cli` - the `start`/`stop`/`status` front end used by the binaries
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       temlinkd daemon                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │  GatewayServer  │────▶│        MessageBus           │    │
//! │  │  (Unix Socket)  │◀────│   (broadcast::Sender)       │    │
//! │  └─────────────────┘     └──────┬───────────────▲──────┘    │
//! │                                 │ commands      │ status    │
//! │                                 ▼               │           │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │  control loop   │────▶│          Bridge             │    │
//! │  │  (std thread)   │     │  Mutex<hardware + state>    │    │
//! │  └─────────────────┘     └─────────────────────────────┘    │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows a panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod bridge;
pub mod bus;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod hardware;
pub mod server;
