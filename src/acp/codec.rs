//! NDJSON codec for ACP agent streams.
//!
//! Inbound, [`AcpCodec`] yields one UTF-8 line per JSON-RPC envelope. Lines
//! longer than the configured maximum, or not valid UTF-8, are logged and
//! discarded up to the next newline; the stream itself keeps going. JSON
//! parsing is left to the reader so that a malformed line is skipped rather
//! than poisoning the framed stream.
//!
//! Outbound, [`AcpCodec`] encodes a [`Message`] as one compact JSON object
//! followed by `\n`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tokio_util::codec::{FramedRead, FramedWrite};
//! use acp_host::acp::codec::AcpCodec;
//!
//! let lines = FramedRead::new(child_stdout, AcpCodec::new());
//! let sink = FramedWrite::new(child_stdin, AcpCodec::new());
//! ```

use std::io::ErrorKind;

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};
use tracing::warn;

use crate::acp::message::Message;
use crate::{AppError, Result};

/// Maximum line length accepted by the ACP codec: 64 MiB.
///
/// Large enough for whole-file `fs/write_text_file` payloads. A longer line
/// is dropped and decoding resumes after its newline.
pub const MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

/// NDJSON codec for bidirectional ACP agent streams.
#[derive(Debug)]
pub struct AcpCodec(LinesCodec);

impl AcpCodec {
    /// Create a new `AcpCodec` with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line_bytes(MAX_LINE_BYTES)
    }

    /// Create a codec with a custom inbound line limit.
    #[must_use]
    pub fn with_max_line_bytes(max: usize) -> Self {
        Self(LinesCodec::new_with_max_length(max))
    }
}

impl Default for AcpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for AcpCodec {
    type Item = String;
    type Error = AppError;

    /// Decode the next newline-terminated line from `src`.
    ///
    /// Returns `Ok(None)` while `src` holds no complete line yet. A trailing
    /// `\r` is stripped by [`LinesCodec`]. Oversized and non-UTF-8 lines are
    /// skipped; only a genuine I/O failure is returned as an error.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.0.decode(src) {
                Ok(line) => return Ok(line),
                Err(e) => skip_or_fail(e)?,
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.0.decode_eof(src) {
                Ok(line) => return Ok(line),
                Err(e) => skip_or_fail(e)?,
            }
        }
    }
}

impl Encoder<Message> for AcpCodec {
    type Error = AppError;

    /// Encode `item` as one compact JSON object terminated by `\n`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Acp`] if the message cannot be serialised.
    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let line = item.to_line()?;
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Log a recoverable framing error, or map a fatal one to [`AppError::Io`].
///
/// After `MaxLineLengthExceeded` the inner [`LinesCodec`] is in discard mode
/// and resyncs at the next newline. An invalid UTF-8 line has already been
/// consumed when it is reported.
fn skip_or_fail(e: LinesCodecError) -> Result<()> {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            warn!("acp codec: inbound line exceeds limit, discarding");
            Ok(())
        }
        LinesCodecError::Io(io_err) if io_err.kind() == ErrorKind::InvalidData => {
            warn!(error = %io_err, "acp codec: inbound line is not valid UTF-8, discarding");
            Ok(())
        }
        LinesCodecError::Io(io_err) => Err(AppError::Io(io_err.to_string())),
    }
}
