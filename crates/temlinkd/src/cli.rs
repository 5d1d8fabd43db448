//! Command-line front end shared by the `temlinkd` binaries.
//!
//! `start` runs the service (optionally daemonized), `stop` signals the
//! running instance through its PID file, `status` reports on it.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::BridgeConfig;

/// temlink daemon - microscope message bus bridge
#[derive(Parser, Debug)]
#[command(name = "temlinkd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Gateway socket path (overrides config and TEMLINK_SOCKET)
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Linear motion tolerance, device units
        #[arg(long)]
        trans_tol: Option<f64>,

        /// Angular motion tolerance, radians
        #[arg(long)]
        rot_tol: Option<f64>,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

/// Returns the state directory holding the PID and log files.
fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("temlink")
}

/// Returns the path to the PID file.
fn pid_file_path() -> PathBuf {
    state_dir().join("temlinkd.pid")
}

/// Returns the path to the log file.
fn log_file_path() -> PathBuf {
    state_dir().join("temlinkd.log")
}

/// Reads the PID from the PID file, if it exists.
fn read_pid() -> Option<u32> {
    let path = pid_file_path();
    let mut file = File::open(&path).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

/// Writes the current PID to the PID file.
fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

/// Removes the PID file.
fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

/// Checks if a process with the given PID is running.
fn is_process_running(pid: u32) -> bool {
    // Linux-only: the daemon relies on /proc
    PathBuf::from(format!("/proc/{pid}")).exists()
}

/// Checks if the daemon is already running.
fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        // Stale PID file
        remove_pid_file();
    }
    None
}

/// Sends SIGTERM to the daemon process.
fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let pid = i32::try_from(pid).context("PID out of range")?;
        // SAFETY: kill has no memory-safety preconditions
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

/// Resolves the effective configuration: file, then env, then flags.
fn load_config(
    path: Option<PathBuf>,
    socket: Option<PathBuf>,
    trans_tol: Option<f64>,
    rot_tol: Option<f64>,
) -> Result<BridgeConfig> {
    let mut config = BridgeConfig::load(path.as_deref()).context("Failed to load configuration")?;
    if let Some(socket) = socket {
        config.socket_path = socket;
    }
    if let Some(trans_tol) = trans_tol {
        config.trans_tol = trans_tol;
    }
    if let Some(rot_tol) = rot_tol {
        config.rot_tol = rot_tol;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Parses the process arguments and runs the selected command.
///
/// # Errors
///
/// Fails on invalid configuration, an unreachable instrument, or a daemon
/// that cannot be started or stopped.
pub fn run() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        config: None,
        socket: None,
        trans_tol: None,
        rot_tol: None,
    });

    match command {
        Command::Start {
            daemon,
            config,
            socket,
            trans_tol,
            rot_tol,
        } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'temlinkd stop' to stop it first.");
                process::exit(1);
            }

            // Fail before forking so config errors reach the terminal
            let config = load_config(config, socket, trans_tol, rot_tol)?;

            if daemon {
                daemonize()?;
            }

            write_pid()?;
            let result = run_daemon(config);
            remove_pid_file();
            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping daemon (PID {pid})...");
                stop_daemon(pid)?;

                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status => {
            if let Some(pid) = is_daemon_running() {
                println!("Daemon is running (PID {pid})");

                let config = BridgeConfig::load(None).unwrap_or_default();
                if config.socket_path.exists() {
                    println!("Socket: {}", config.socket_path.display());
                }

                Ok(())
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
    }
}

/// Daemonizes the current process.
fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

/// Runs the daemon (async entry point).
#[tokio::main]
async fn run_daemon(config: BridgeConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("temlinkd=info".parse()?)
                .add_directive("temlink_core=info".parse()?)
                .add_directive("temlink_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "temlink daemon starting"
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

    info!(
        socket = %config.socket_path.display(),
        trans_tol = config.trans_tol,
        rot_tol = config.rot_tol,
        "Starting bridge"
    );

    if let Err(e) = crate::daemon::run(config, cancel_token).await {
        error!(error = %e, "Daemon error");
        return Err(e);
    }

    info!("temlink daemon stopped");
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
