#![forbid(unsafe_code)]

//! `exec-daemon`: remote test execution daemon binary.
//!
//! Resolves the bind address from the environment, positional arguments and
//! optional TOML config, starts the server, and runs until a signal arrives
//! or a client sends `CMD stop`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use exec_daemon::server::{Server, ServerState};
use exec_daemon::{AppError, DaemonConfig, Result};

/// Overrides the bind host argument when set.
const ENV_BIND_NAME: &str = "EXEC_DAEMON_BIND_NAME";
/// Overrides the bind port argument when set.
const ENV_BIND_PORT: &str = "EXEC_DAEMON_BIND_PORT";

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "exec-daemon", about = "Remote test execution daemon", version, long_about = None)]
struct Cli {
    /// Host name or address to bind (wildcard when omitted).
    host: Option<String>,

    /// Port to bind; 0 or empty picks an ephemeral port.
    port: Option<String>,

    /// Path to an optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    let mut config = match &args.config {
        Some(path) => DaemonConfig::load_from_path(path)?,
        None => DaemonConfig::default(),
    };
    apply_bind_overrides(&mut config, &args)?;
    info!(
        bind_address = config.server.bind_address.as_deref().unwrap_or("0.0.0.0"),
        port = config.server.port,
        "exec-daemon bootstrap"
    );

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.worker_threads)
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(config))
}

async fn run(config: DaemonConfig) -> Result<()> {
    let server = Server::from_config(&config.server)?;
    server.start().await?;
    let mut state = server.subscribe();

    tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown signal received");
            match server.stop().await {
                // Already stopped by a client between the signal and here.
                Ok(()) | Err(AppError::Lifecycle(_)) => {}
                Err(err) => error!(%err, "error during shutdown"),
            }
        }
        stopped = state.wait_for(|state| *state == ServerState::Stopped) => {
            if let Err(err) = stopped {
                error!(%err, "lost track of server state");
            }
            info!("stopped by client request");
        }
    }

    info!("exec-daemon shut down");
    Ok(())
}

/// Layer positional arguments and environment variables over the config
/// file; the environment wins.
fn apply_bind_overrides(config: &mut DaemonConfig, args: &Cli) -> Result<()> {
    let host = std::env::var(ENV_BIND_NAME).ok().or_else(|| args.host.clone());
    if let Some(host) = host.filter(|host| !host.trim().is_empty()) {
        config.server.bind_address = Some(host);
    }

    let port = std::env::var(ENV_BIND_PORT).ok().or_else(|| args.port.clone());
    if let Some(port) = port {
        config.server.port = parse_port(&port)?;
    }
    Ok(())
}

fn parse_port(raw: &str) -> Result<u16> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(0);
    }
    raw.parse::<u16>()
        .map_err(|_| AppError::Config(format!("Bind port must be between 0 and 65535: {raw}")))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
