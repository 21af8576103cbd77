//! Per-connection processing loop.
//!
//! A [`Connection`] owns its transport, its [`Dispatcher`] and its
//! [`ConnectionPhase`]; nothing here is shared with other connections.
//! Frames are handled strictly in arrival order: the next frame is not
//! read until the previous one has been answered.
//!
//! Once the server is stopping, a reply the peer is not reading is
//! abandoned instead of holding up shutdown. Running test invocations are
//! never interrupted.
//!
//! | Frame    | Response                          | Connection after |
//! |----------|-----------------------------------|------------------|
//! | command  | `OK`/`ERR` line or raw result     | open             |
//! | deploy   | `OK DPL <id>`                     | open             |
//! | deploy (failed) | none                       | closed           |
//! | unknown  | `ERR Unsupported Command`         | closed           |

use std::sync::Arc;

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::protocol::codec::{FrameCodec, Response};
use crate::protocol::wire::{RESPONSE_ERROR_PREFIX, UNSUPPORTED_COMMAND};
use crate::server::command::{self, CommandReply};
use crate::server::deploy;
use crate::server::dispatch::{ConnectionPhase, Dispatch, Dispatcher};
use crate::server::ServerContext;
use crate::{AppError, Result};

/// Whether the connection keeps serving after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Wait for the next frame.
    Continue,
    /// Close the connection.
    Close,
}

/// One client session over any byte transport.
#[derive(Debug)]
pub struct Connection<T> {
    framed: Framed<T, FrameCodec>,
    context: Arc<ServerContext>,
    dispatcher: Dispatcher,
    phase: ConnectionPhase,
    cancel: CancellationToken,
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap `io` with the frame codec.
    pub fn new(io: T, context: Arc<ServerContext>, max_frame_bytes: usize) -> Self {
        Self {
            framed: Framed::new(io, FrameCodec::new(max_frame_bytes)),
            context,
            dispatcher: Dispatcher::new(),
            phase: ConnectionPhase::AwaitingFrame,
            cancel: CancellationToken::new(),
        }
    }

    /// Current processing phase.
    #[must_use]
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Serve frames until the peer disconnects, a frame closes the
    /// connection, or `cancel` fires between frames.
    ///
    /// # Errors
    ///
    /// Returns transport failures, framing errors, and deploy failures; the
    /// connection is closed in every case.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        self.cancel = cancel.clone();
        loop {
            let next = tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    debug!("server stopping, closing connection");
                    break;
                }

                next = self.framed.next() => next,
            };

            let frame = match next {
                None => {
                    debug!("peer closed connection");
                    break;
                }
                Some(Ok(frame)) => frame,
                Some(Err(err)) => {
                    if matches!(err, AppError::Protocol(_)) {
                        let line = format!("{RESPONSE_ERROR_PREFIX}{err}");
                        if let Err(send_err) = self.send(Response::Line(line)).await {
                            debug!(%send_err, "could not report framing error");
                        }
                    }
                    return Err(err);
                }
            };

            if self.handle_frame(frame).await? == FrameOutcome::Close {
                break;
            }
        }
        Ok(())
    }

    /// Classify and answer one frame, then reset the phase.
    ///
    /// # Errors
    ///
    /// Returns transport failures and deploy failures.
    pub async fn handle_frame(&mut self, frame: BytesMut) -> Result<FrameOutcome> {
        self.enter(ConnectionPhase::Dispatching);
        let outcome = self.dispatch(frame).await;
        self.enter(ConnectionPhase::AwaitingFrame);
        outcome
    }

    async fn dispatch(&mut self, frame: BytesMut) -> Result<FrameOutcome> {
        let dispatch = match self.dispatcher.dispatch(frame) {
            Ok(dispatch) => dispatch,
            Err(err) => {
                warn!(%err, "rejecting command frame");
                self.send(command::error_response(&err)).await?;
                return Ok(FrameOutcome::Continue);
            }
        };

        match dispatch {
            Dispatch::Pending => {
                trace!(
                    carried = self.dispatcher.carried().len(),
                    "frame too short to classify, waiting for more"
                );
                Ok(FrameOutcome::Continue)
            }
            Dispatch::Unsupported => {
                warn!("unsupported frame marker, closing connection");
                let line = format!("{RESPONSE_ERROR_PREFIX}{UNSUPPORTED_COMMAND}");
                self.send(Response::Line(line)).await?;
                Ok(FrameOutcome::Close)
            }
            Dispatch::Command(line) => {
                self.enter(ConnectionPhase::HandlingCommand);
                self.handle_command(&line).await?;
                Ok(FrameOutcome::Continue)
            }
            Dispatch::Deploy(payload) => {
                self.enter(ConnectionPhase::HandlingDeploy);
                let response = deploy::ingest(&self.context, &payload)?;
                self.send(response).await?;
                Ok(FrameOutcome::Continue)
            }
        }
    }

    async fn handle_command(&mut self, line: &str) -> Result<()> {
        trace!(command = line, "got command");
        match command::execute(&self.context, line).await {
            Ok(CommandReply::Respond(response)) => self.send(response).await,
            Ok(CommandReply::RespondThenStop(response)) => {
                // `send` flushes, so the client has the reply before the
                // listener goes away.
                self.send(response).await?;
                self.context.request_stop();
                Ok(())
            }
            Err(err) => {
                warn!(%err, command = line, "command failed");
                self.send(command::error_response(&err)).await
            }
        }
    }

    /// Write and flush one response, giving up if the server stops while
    /// the peer is not reading.
    async fn send(&mut self, response: Response) -> Result<()> {
        tokio::select! {
            biased;

            sent = self.framed.send(response) => sent,
            () = self.cancel.cancelled() => Err(AppError::Io(
                "server stopping, peer not reading; response dropped".into(),
            )),
        }
    }

    fn enter(&mut self, phase: ConnectionPhase) {
        trace!(from = %self.phase, to = %phase, "connection phase");
        self.phase = phase;
    }
}
