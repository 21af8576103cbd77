//! Server start/stop state machine and the TCP accept loop.
//!
//! `Stopped --start()--> Running(addr) --stop()--> Stopped`
//!
//! Every transition happens while holding one async mutex, so the
//! "already running" and "not running" checks cannot race. Observers read
//! the published [`ServerState`] through a `watch` channel without taking
//! that lock.
//!
//! A `CMD stop` received on a connection never stops the server on the
//! connection's own task: it signals a dedicated stop worker spawned at
//! start, which calls [`Server::stop`] once the reply has been flushed.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Weak};

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::archive::{ArchiveImporter, ZipImporter};
use crate::config::ServerConfig;
use crate::execution::{ProcessExecutor, TestExecutor};
use crate::protocol::codec::DEFAULT_MAX_FRAME_BYTES;
use crate::server::connection::Connection;
use crate::server::ServerContext;
use crate::store::DeploymentStore;
use crate::{AppError, Result};

/// Highest valid bind port.
pub const MAX_PORT: u32 = 65_535;

/// Observable lifecycle state of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Not listening.
    Stopped,
    /// Binding the listener.
    Starting,
    /// Listening on the contained (actual) address.
    Running(SocketAddr),
    /// Closing the listener and open connections.
    Stopping,
}

/// Collaborators and limits for a [`Server`].
#[derive(Clone)]
pub struct ServerOptions {
    /// Largest accepted frame in bytes.
    pub max_frame_bytes: usize,
    /// Turns deploy payloads into archives.
    pub importer: Arc<dyn ArchiveImporter>,
    /// Runs test invocations.
    pub executor: Arc<dyn TestExecutor>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            importer: Arc::new(ZipImporter),
            executor: Arc::new(ProcessExecutor),
        }
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("max_frame_bytes", &self.max_frame_bytes)
            .finish_non_exhaustive()
    }
}

/// The remote execution daemon. Cheap to clone; clones share one instance.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    bind_address: SocketAddr,
    options: ServerOptions,
    store: Arc<DeploymentStore>,
    lifecycle: Mutex<Lifecycle>,
    state_tx: watch::Sender<ServerState>,
}

enum Lifecycle {
    Stopped,
    Running(RunningServer),
}

struct RunningServer {
    cancel: CancellationToken,
    tracker: TaskTracker,
    accept_task: JoinHandle<()>,
    stop_worker: JoinHandle<()>,
}

impl Server {
    /// Create a server for `bind_address:port` with default collaborators.
    ///
    /// Omitting the address binds the wildcard address; port `0` lets the
    /// system choose. Nothing is bound until [`Server::start`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the port is out of range or the address
    /// cannot be resolved.
    pub fn create(bind_address: Option<&str>, port: u32) -> Result<Self> {
        let address = resolve_bind_address(bind_address, port)?;
        Ok(Self::with_options(address, ServerOptions::default()))
    }

    /// Create a server from a `[server]` config section.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the address cannot be resolved.
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let address = resolve_bind_address(config.bind_address.as_deref(), config.port.into())?;
        let options = ServerOptions {
            max_frame_bytes: config.max_frame_bytes,
            ..ServerOptions::default()
        };
        Ok(Self::with_options(address, options))
    }

    /// Create a server bound (on start) to `bind_address` with explicit collaborators.
    #[must_use]
    pub fn with_options(bind_address: SocketAddr, options: ServerOptions) -> Self {
        let (state_tx, _) = watch::channel(ServerState::Stopped);
        Self {
            inner: Arc::new(ServerInner {
                bind_address,
                options,
                store: Arc::new(DeploymentStore::new()),
                lifecycle: Mutex::new(Lifecycle::Stopped),
                state_tx,
            }),
        }
    }

    /// Address configured for binding.
    #[must_use]
    pub fn bind_address(&self) -> SocketAddr {
        self.inner.bind_address
    }

    /// Deployments held by this server instance.
    #[must_use]
    pub fn store(&self) -> Arc<DeploymentStore> {
        Arc::clone(&self.inner.store)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        *self.inner.state_tx.borrow()
    }

    /// Watch lifecycle state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.inner.state_tx.subscribe()
    }

    /// Whether the server is currently listening.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self.state(), ServerState::Running(_))
    }

    /// Actual bound address.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lifecycle` if the server is not running.
    pub fn bound_address(&self) -> Result<SocketAddr> {
        match self.state() {
            ServerState::Running(address) => Ok(address),
            _ => Err(AppError::Lifecycle("Server is not running".into())),
        }
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Returns the actual bound address, which differs from the configured
    /// one when port `0` was requested.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lifecycle` if the server is already running or the
    /// listener cannot be bound.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if matches!(*lifecycle, Lifecycle::Running(_)) {
            return Err(AppError::Lifecycle("Already running".into()));
        }

        self.inner.state_tx.send_replace(ServerState::Starting);
        let (listener, bound) = match bind(self.inner.bind_address).await {
            Ok(bound) => bound,
            Err(err) => {
                self.inner.state_tx.send_replace(ServerState::Stopped);
                return Err(err);
            }
        };

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let context = Arc::new(ServerContext::new(
            Arc::clone(&self.inner.store),
            Arc::clone(&self.inner.options.importer),
            Arc::clone(&self.inner.options.executor),
            stop_tx,
        ));

        let accept_task = tokio::spawn(
            accept_loop(
                listener,
                context,
                cancel.clone(),
                tracker.clone(),
                self.inner.options.max_frame_bytes,
            )
            .instrument(info_span!("server", %bound)),
        );
        let stop_worker = tokio::spawn(run_stop_worker(
            Arc::downgrade(&self.inner),
            cancel.clone(),
            stop_rx,
        ));

        *lifecycle = Lifecycle::Running(RunningServer {
            cancel,
            tracker,
            accept_task,
            stop_worker,
        });
        self.inner.state_tx.send_replace(ServerState::Running(bound));
        info!(%bound, "Server started");
        Ok(bound)
    }

    /// Close the listener and every open connection.
    ///
    /// Frames already being handled, including running tests, complete
    /// first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lifecycle` if the server is not running.
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.stop_locked(&mut lifecycle).await
    }

    /// Stop the run identified by `run`, unless it has already ended.
    ///
    /// A run's token is cancelled before the lifecycle lock is released, so
    /// an uncancelled token seen under the lock belongs to the current run.
    async fn stop_run(&self, run: &CancellationToken) -> Result<bool> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if run.is_cancelled() {
            return Ok(false);
        }
        self.stop_locked(&mut lifecycle).await?;
        Ok(true)
    }

    async fn stop_locked(&self, lifecycle: &mut Lifecycle) -> Result<()> {
        let running = match std::mem::replace(lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running(running) => running,
            Lifecycle::Stopped => {
                return Err(AppError::Lifecycle("Server is not running".into()));
            }
        };

        self.inner.state_tx.send_replace(ServerState::Stopping);
        info!("Requesting shutdown...");

        running.cancel.cancel();
        if let Err(err) = running.accept_task.await {
            warn!(%err, "accept loop terminated abnormally");
        }
        running.tracker.close();
        running.tracker.wait().await;
        // The stop worker exits on its own once every context sender is gone.
        drop(running.stop_worker);

        self.inner.state_tx.send_replace(ServerState::Stopped);
        info!("Server shutdown.");
        Ok(())
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("bind_address", &self.inner.bind_address)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Validate `port` and resolve `bind_address` without binding.
fn resolve_bind_address(bind_address: Option<&str>, port: u32) -> Result<SocketAddr> {
    let port = u16::try_from(port)
        .map_err(|_| AppError::Config(format!("Bind port must be between 0 and {MAX_PORT}")))?;

    let Some(host) = bind_address else {
        return Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));
    };

    (host, port)
        .to_socket_addrs()
        .map_err(|err| AppError::Config(format!("Address \"{host}\" could not be resolved: {err}")))?
        .next()
        .ok_or_else(|| AppError::Config(format!("Address \"{host}\" could not be resolved")))
}

async fn bind(address: SocketAddr) -> Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(address).await.map_err(|err| {
        AppError::Lifecycle(format!(
            "Encountered error in binding {address}; could not start server: {err}"
        ))
    })?;
    let bound = listener
        .local_addr()
        .map_err(|err| AppError::Lifecycle(format!("could not read bound address: {err}")))?;
    Ok((listener, bound))
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<ServerContext>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    max_frame_bytes: usize,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("listener shutting down");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        if let Err(err) = stream.set_nodelay(true) {
                            debug!(%err, %peer, "could not set TCP_NODELAY");
                        }
                        let connection =
                            Connection::new(stream, Arc::clone(&context), max_frame_bytes);
                        let cancel = cancel.clone();
                        tracker.spawn(
                            async move {
                                debug!("connection accepted");
                                match connection.run(cancel).await {
                                    Ok(()) => debug!("connection closed"),
                                    Err(err) => warn!(%err, "connection closed on error"),
                                }
                            }
                            .instrument(info_span!("connection", %peer)),
                        );
                    }
                    Err(err) => {
                        warn!(%err, "accept failed");
                    }
                }
            }
        }
    }
}

/// Wait for a stop request from a connection and stop the run it came from.
async fn run_stop_worker(
    server: Weak<ServerInner>,
    run: CancellationToken,
    mut stop_rx: mpsc::Receiver<()>,
) {
    if stop_rx.recv().await.is_none() {
        return;
    }
    let Some(inner) = server.upgrade() else {
        return;
    };
    let server = Server { inner };
    match server.stop_run(&run).await {
        Ok(true) => info!("stopped via wire protocol"),
        Ok(false) => debug!("run already stopped, ignoring stop request"),
        Err(err) => warn!(%err, "requested stop failed"),
    }
}
