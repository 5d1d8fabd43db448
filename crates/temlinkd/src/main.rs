//! temlink daemon - microscope bridge onto a message bus
//!
//! This binary connects to the instrument, runs the control loop and
//! exposes the message bus on a Unix socket.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! temlinkd start
//!
//! # Start the daemon (background/daemonized)
//! temlinkd start -d
//!
//! # Start with a config file and a wider translation band
//! temlinkd start --config /etc/temlink.toml --trans-tol 80
//!
//! # Stop the daemon
//! temlinkd stop
//!
//! # Check daemon status
//! temlinkd status
//!
//! # Start with custom socket path
//! TEMLINK_SOCKET=/run/temlink.sock temlinkd start
//!
//! # Enable debug logging
//! RUST_LOG=temlinkd=debug temlinkd start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown

fn main() -> anyhow::Result<()> {
    temlinkd::cli::run()
}
