//! Error types shared across the daemon, its protocol engine, and the client driver.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing, CLI, or bind-address validation failure.
    Config(String),
    /// Unrecognized or oversized frame; the connection is closed.
    Protocol(String),
    /// Malformed or unsupported textual command.
    Command(String),
    /// Archive import or storage failure on the deploy path.
    Deploy(String),
    /// Test execution adapter failure.
    Execution(String),
    /// Requested deployment does not exist.
    NotFound(String),
    /// Illegal server or client state transition.
    Lifecycle(String),
    /// No connection could be established before the retry deadline.
    ConnectTimeout(String),
    /// File-system or transport I/O failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Command(msg) => write!(f, "command: {msg}"),
            Self::Deploy(msg) => write!(f, "deploy: {msg}"),
            Self::Execution(msg) => write!(f, "execution: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Lifecycle(msg) => write!(f, "lifecycle: {msg}"),
            Self::ConnectTimeout(msg) => write!(f, "connect timeout: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Execution(format!("invalid test result encoding: {err}"))
    }
}

impl From<zip::result::ZipError> for AppError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Deploy(format!("invalid archive: {err}"))
    }
}
