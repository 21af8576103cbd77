#![forbid(unsafe_code)]

//! `exec-daemon-ctl`: command-line client for `exec-daemon`.
//!
//! Opens one connection per invocation and drives the wire protocol through
//! [`DaemonClient`].

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use exec_daemon::client::DaemonClient;
use exec_daemon::config::ClientConfig;
use exec_daemon::execution::{TestResult, TestStatus};
use exec_daemon::{AppError, DaemonConfig, Result};

#[derive(Debug, Parser)]
#[command(
    name = "exec-daemon-ctl",
    about = "Client for the exec-daemon wire protocol",
    version,
    long_about = None
)]
struct Cli {
    /// Daemon host (overrides the config file).
    #[arg(long)]
    host: Option<String>,

    /// Daemon port (overrides the config file).
    #[arg(long)]
    port: Option<u16>,

    /// Seconds to keep retrying a refused connection.
    #[arg(long)]
    timeout_seconds: Option<u64>,

    /// Path to a TOML configuration file with a `[client]` section.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Deploy a ZIP archive and print its deployment ID.
    Deploy {
        /// Archive file to upload.
        archive: PathBuf,
    },

    /// Remove a deployment.
    Undeploy {
        /// Deployment ID returned by `deploy`.
        id: String,
    },

    /// Run one test method in an existing deployment.
    Test {
        /// Deployment ID.
        id: String,
        /// Test class (entry path inside the archive).
        class: String,
        /// Method name passed to the test.
        method: String,
    },

    /// Deploy an archive, run one test method, then undeploy.
    Run {
        /// Archive file to upload.
        archive: PathBuf,
        /// Test class (entry path inside the archive).
        class: String,
        /// Method name passed to the test.
        method: String,
    },

    /// Stop the daemon.
    Stop,
}

fn main() -> ExitCode {
    let args = Cli::parse();

    match execute(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("Error: {err}");
            if matches!(err, AppError::ConnectTimeout(_)) {
                eprintln!("Is exec-daemon running and reachable?");
            }
            ExitCode::FAILURE
        }
    }
}

/// Run the selected subcommand; `Ok(false)` reports a failed test.
fn execute(args: Cli) -> Result<bool> {
    let config = client_config(&args)?;
    let mut client = DaemonClient::connect(&config)?;

    match args.command {
        Command::Deploy { archive } => {
            let bytes = read_archive(&archive)?;
            println!("{}", client.deploy_bytes(&bytes)?);
        }
        Command::Undeploy { id } => {
            client.undeploy_id(&id)?;
            println!("OK {id}");
        }
        Command::Test { id, class, method } => {
            let result = client.invoke_test_on(&id, &class, &method)?;
            return Ok(report(&result));
        }
        Command::Run {
            archive,
            class,
            method,
        } => {
            let bytes = read_archive(&archive)?;
            let result = client.run_test(&bytes, &class, &method)?;
            return Ok(report(&result));
        }
        Command::Stop => {
            client.stop()?;
            println!("OK");
        }
    }

    client.close();
    Ok(true)
}

fn client_config(args: &Cli) -> Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => DaemonConfig::load_from_path(path)?.client,
        None => ClientConfig::default(),
    };
    if let Some(host) = &args.host {
        config.host.clone_from(host);
    }
    if let Some(port) = args.port {
        config.port = Some(port);
    }
    if let Some(timeout) = args.timeout_seconds {
        config.connect_timeout_seconds = timeout;
    }
    Ok(config)
}

fn read_archive(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|err| AppError::Io(format!("cannot read {}: {err}", path.display())))
}

fn report(result: &TestResult) -> bool {
    let elapsed = result.finished_at - result.started_at;
    println!("{:?} in {}ms", result.status, elapsed.num_milliseconds());
    if let Some(message) = &result.message {
        println!("{message}");
    }
    result.status != TestStatus::Failed
}
