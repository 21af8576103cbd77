//! Delimiter framing for inbound requests and encoding for outbound responses.
//!
//! Inbound, the byte stream is split on [`COMMAND_EOF_DELIMITER`]; each frame
//! is yielded with the delimiter stripped and without any interpretation of
//! its contents. Outbound, a [`Response`] is either a `\r\n`-terminated text
//! line or a raw byte payload written verbatim.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tokio_util::codec::Framed;
//! use exec_daemon::protocol::codec::FrameCodec;
//!
//! let framed = Framed::new(tcp_stream, FrameCodec::new(max_frame_bytes));
//! ```

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::protocol::wire::{COMMAND_EOF_DELIMITER, RESPONSE_LINE_DELIMITER};
use crate::{AppError, Result};

/// Default upper bound for a single frame: 64 MiB.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Outbound response written to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Single textual line; the line delimiter is appended on encode.
    Line(String),
    /// Raw bytes with no envelope or delimiter.
    Raw(Bytes),
}

/// Codec splitting inbound bytes on `<<EOF` and encoding [`Response`]s.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_bytes: usize,
    /// Offset up to which the buffer is known not to contain a delimiter.
    next_index: usize,
}

impl FrameCodec {
    /// Create a codec rejecting frames longer than `max_frame_bytes`.
    #[must_use]
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            next_index: 0,
        }
    }

    /// Configured frame size limit.
    #[must_use]
    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = AppError;

    /// Return the next complete frame with the delimiter removed.
    ///
    /// Returns `Ok(None)` while the delimiter has not arrived yet.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let delimiter = COMMAND_EOF_DELIMITER.as_bytes();

        // A delimiter may straddle the previous read boundary.
        let start = self.next_index.saturating_sub(delimiter.len() - 1);
        let found = src[start..]
            .windows(delimiter.len())
            .position(|window| window == delimiter)
            .map(|offset| start + offset);

        match found {
            Some(end) => {
                self.next_index = 0;
                if end > self.max_frame_bytes {
                    return Err(frame_too_long(self.max_frame_bytes));
                }
                let frame = src.split_to(end);
                let _ = src.split_to(delimiter.len());
                Ok(Some(frame))
            }
            None => {
                if src.len() > self.max_frame_bytes + delimiter.len() {
                    return Err(frame_too_long(self.max_frame_bytes));
                }
                self.next_index = src.len();
                Ok(None)
            }
        }
    }

    /// Decode remaining frames at end of stream.
    ///
    /// Trailing bytes without a delimiter are an abandoned partial frame and
    /// are discarded.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if !src.is_empty() {
            debug!(bytes = src.len(), "discarding unterminated frame at end of stream");
            src.clear();
            self.next_index = 0;
        }
        Ok(None)
    }
}

impl Encoder<Response> for FrameCodec {
    type Error = AppError;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<()> {
        match item {
            Response::Line(line) => {
                dst.reserve(line.len() + RESPONSE_LINE_DELIMITER.len());
                dst.extend_from_slice(line.as_bytes());
                dst.extend_from_slice(RESPONSE_LINE_DELIMITER.as_bytes());
            }
            Response::Raw(bytes) => dst.extend_from_slice(&bytes),
        }
        Ok(())
    }
}

fn frame_too_long(max: usize) -> AppError {
    AppError::Protocol(format!("frame too long: exceeded {max} bytes"))
}
