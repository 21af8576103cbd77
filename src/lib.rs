#![forbid(unsafe_code)]

pub mod archive;
pub mod client;
pub mod config;
pub mod errors;
pub mod execution;
pub mod protocol;
pub mod server;
pub mod store;

pub use config::DaemonConfig;
pub use errors::{AppError, Result};
