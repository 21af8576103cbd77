//! Frame detection and per-connection phase tracking.
//!
//! A connection is always in one of the [`ConnectionPhase`]s. A frame moves
//! it from `AwaitingFrame` to `Dispatching`, where [`classify`] picks a
//! handler by the frame's leading marker bytes; once the handler has
//! responded the phase is reset to `AwaitingFrame`, so every frame on a
//! connection is classified independently.
//!
//! [`classify`]: crate::protocol::wire::classify

use std::fmt;

use bytes::BytesMut;

use crate::protocol::wire::{classify, FrameKind, COMMAND_DEPLOY_PREFIX};
use crate::{AppError, Result};

/// Longest accepted command line, in bytes.
pub const MAX_COMMAND_LINE_BYTES: usize = 2000;

/// Processing phase of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    /// Waiting for the next delimiter-terminated frame.
    #[default]
    AwaitingFrame,
    /// A frame arrived and is being classified.
    Dispatching,
    /// A textual command is being executed.
    HandlingCommand,
    /// A deploy payload is being ingested.
    HandlingDeploy,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AwaitingFrame => "awaiting_frame",
            Self::Dispatching => "dispatching",
            Self::HandlingCommand => "handling_command",
            Self::HandlingDeploy => "handling_deploy",
        };
        f.write_str(name)
    }
}

/// What a classified frame should be handed to.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Full command line, marker included.
    Command(String),
    /// Archive bytes with the deploy marker removed.
    Deploy(BytesMut),
    /// Unrecognized marker; the connection must be closed.
    Unsupported,
    /// Not enough bytes to classify yet.
    Pending,
}

/// Classifies frames, carrying short frames over until they can be classified.
#[derive(Debug, Default)]
pub struct Dispatcher {
    carry: BytesMut,
}

impl Dispatcher {
    /// Create a dispatcher with an empty carry-over buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held back from earlier frames too short to classify.
    #[must_use]
    pub fn carried(&self) -> &[u8] {
        &self.carry
    }

    /// Classify `frame`, prefixed with any carried-over bytes.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Command` if a command line exceeds
    /// [`MAX_COMMAND_LINE_BYTES`].
    pub fn dispatch(&mut self, frame: BytesMut) -> Result<Dispatch> {
        let mut frame = if self.carry.is_empty() {
            frame
        } else {
            let mut merged = self.carry.split();
            merged.extend_from_slice(&frame);
            merged
        };

        match classify(&frame) {
            FrameKind::Incomplete => {
                self.carry = frame;
                Ok(Dispatch::Pending)
            }
            FrameKind::Unknown => Ok(Dispatch::Unsupported),
            FrameKind::Deploy => {
                let marker = COMMAND_DEPLOY_PREFIX.len().min(frame.len());
                let _ = frame.split_to(marker);
                Ok(Dispatch::Deploy(frame))
            }
            FrameKind::Command => command_line(&frame).map(Dispatch::Command),
        }
    }
}

/// First line of a command frame, decoded as UTF-8.
///
/// Invalid UTF-8 sequences are replaced rather than rejected.
///
/// # Errors
///
/// Returns `AppError::Command` if the line exceeds [`MAX_COMMAND_LINE_BYTES`].
pub fn command_line(frame: &[u8]) -> Result<String> {
    let end = frame
        .iter()
        .position(|byte| *byte == b'\n')
        .unwrap_or(frame.len());
    let mut line = &frame[..end];
    if let Some(stripped) = line.strip_suffix(b"\r") {
        line = stripped;
    }
    if line.len() > MAX_COMMAND_LINE_BYTES {
        return Err(AppError::Command(format!(
            "command line too long: exceeded {MAX_COMMAND_LINE_BYTES} bytes"
        )));
    }
    Ok(String::from_utf8_lossy(line).into_owned())
}
