//! Daemon server: listener lifecycle and per-connection protocol handling.
//!
//! Each accepted TCP connection runs as one task that cycles through
//! frame detection ([`dispatch`]), command or deploy processing
//! ([`command`], [`deploy`]) and response, then resets for the next frame.
//! The [`DeploymentStore`] is the only state shared across connections.

pub mod command;
pub mod connection;
pub mod deploy;
pub mod dispatch;
pub mod lifecycle;

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::archive::ArchiveImporter;
use crate::execution::TestExecutor;
use crate::store::DeploymentStore;

pub use lifecycle::{Server, ServerOptions, ServerState, MAX_PORT};

/// Collaborators shared by every connection of one running server.
pub struct ServerContext {
    /// Deployed archives.
    pub store: Arc<DeploymentStore>,
    /// Packaging boundary used by the deploy path.
    pub importer: Arc<dyn ArchiveImporter>,
    /// Execution boundary used by test invocations.
    pub executor: Arc<dyn TestExecutor>,
    stop_tx: mpsc::Sender<()>,
}

impl ServerContext {
    /// Bundle collaborators; `stop_tx` reaches the server's stop worker.
    #[must_use]
    pub fn new(
        store: Arc<DeploymentStore>,
        importer: Arc<dyn ArchiveImporter>,
        executor: Arc<dyn TestExecutor>,
        stop_tx: mpsc::Sender<()>,
    ) -> Self {
        Self {
            store,
            importer,
            executor,
            stop_tx,
        }
    }

    /// Ask the stop worker to stop the server.
    ///
    /// Never blocks; a request already pending makes this a no-op.
    pub fn request_stop(&self) {
        if let Err(err) = self.stop_tx.try_send(()) {
            debug!(%err, "stop already requested");
        }
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("deployments", &self.store.len())
            .finish_non_exhaustive()
    }
}
