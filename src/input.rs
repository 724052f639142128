//! Line framing and request/reply helpers for upstream connections.
//!
//! A MONITOR connection is a long-lived stream of `\r\n` terminated lines.
//! Reads arrive in arbitrary chunks, so partial lines are kept in a
//! [`BytesMut`] buffer owned by the reader. Because the buffer survives a
//! dropped read future, [`LineReader::read_line`] is cancel-safe and can be
//! raced inside `tokio::select!`.

use bytes::{Buf, BytesMut};
use memchr::memchr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::resp::{RespError, RespValue};

/// Default upper bound for a single line; MONITOR lines carrying huge values
/// are far below this in practice.
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// How much of an over-long line is kept and reported.
pub const LINE_PREVIEW: usize = 1024;

const READ_CHUNK: usize = 4096;

/// Errors that can occur while reading lines or replies from a stream.
#[derive(Error, Debug, PartialEq)]
pub enum LineReadError {
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("connection closed")]
    ConnectionClosed,
    /// The line was skipped up to its terminator; only its first bytes are
    /// kept. The reader stays usable.
    #[error("line exceeds the maximum length")]
    LineTooLong(String),
    #[error("RESP parse error: {0}")]
    RespParseError(#[from] RespError),
}

#[derive(Debug)]
pub struct LineReader<R> {
    reader: R,
    buffer: BytesMut,
    /// Bytes of `buffer` already searched for a terminator.
    scanned: usize,
    /// Set while skipping the rest of an over-long line.
    discarding: bool,
    max_line_length: usize,
}

impl<R> LineReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self::with_max_line_length(reader, MAX_LINE_LENGTH)
    }

    pub fn with_max_line_length(reader: R, max_line_length: usize) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            scanned: 0,
            discarding: false,
            max_line_length,
        }
    }

    /// Reads the next `\r\n` terminated line, without its terminator.
    ///
    /// # Returns
    ///
    /// * `Ok(String)` - The line, decoded lossily as UTF-8
    /// * `Err(LineReadError::ConnectionClosed)` - If the peer closed the stream
    /// * `Err(LineReadError::IoError)` - If reading from the stream fails
    /// * `Err(LineReadError::LineTooLong)` - If the line is longer than the
    ///   maximum length. The error carries its first [`LINE_PREVIEW`] bytes
    ///   and the next call resumes after the line's terminator, without ever
    ///   buffering more than the maximum length.
    pub async fn read_line(&mut self) -> Result<String, LineReadError> {
        loop {
            if let Some(position) = self.find_line_end() {
                if self.discarding {
                    self.consume(position + 2);
                    self.discarding = false;
                    continue;
                }

                if position > self.max_line_length {
                    let preview = self.preview();
                    self.consume(position + 2);
                    return Err(LineReadError::LineTooLong(preview));
                }

                let line = String::from_utf8_lossy(&self.buffer[..position]).into_owned();
                self.consume(position + 2);
                return Ok(line);
            }

            if self.discarding {
                self.drop_scanned();
            } else if self.buffer.len() > self.max_line_length + 1 {
                let preview = self.preview();
                self.drop_scanned();
                self.discarding = true;
                return Err(LineReadError::LineTooLong(preview));
            }

            self.buffer.reserve(READ_CHUNK);
            let number_of_bytes = self
                .reader
                .read_buf(&mut self.buffer)
                .await
                .map_err(|e| LineReadError::IoError(e.to_string()))?;

            if number_of_bytes == 0 {
                return Err(LineReadError::ConnectionClosed);
            }
        }
    }

    /// Number of buffered bytes not yet returned as a line.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Position of the next `\r\n`, searching only bytes not seen before.
    fn find_line_end(&mut self) -> Option<usize> {
        while let Some(offset) = memchr(b'\n', &self.buffer[self.scanned..]) {
            let newline = self.scanned + offset;
            self.scanned = newline + 1;

            if newline > 0 && self.buffer[newline - 1] == b'\r' {
                return Some(newline - 1);
            }
        }

        self.scanned = self.buffer.len();
        None
    }

    fn consume(&mut self, count: usize) {
        self.buffer.advance(count);
        self.scanned = 0;
    }

    /// Drops everything buffered except a trailing `\r`, which may still
    /// pair with a `\n` from the next read.
    fn drop_scanned(&mut self) {
        let keep = usize::from(self.buffer.last() == Some(&b'\r'));
        self.consume(self.buffer.len() - keep);
    }

    fn preview(&self) -> String {
        let end = self.buffer.len().min(LINE_PREVIEW).min(self.max_line_length);
        String::from_utf8_lossy(&self.buffer[..end]).into_owned()
    }
}

/// Writes `command` and reads one single-line reply.
///
/// Only single-line replies (`+`, `-`, `:`) are expected from the commands
/// sent during a MONITOR handshake; anything else is an error and the body
/// of a bulk string or array is never read.
pub async fn send_command<R, W>(
    reader: &mut LineReader<R>,
    writer: &mut W,
    command: &RespValue,
) -> Result<RespValue, LineReadError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_to_stream(writer, command.encode().as_bytes()).await?;

    let line = reader.read_line().await?;
    Ok(RespValue::parse_reply(&line)?)
}

async fn write_to_stream<W>(writer: &mut W, bytes: &[u8]) -> Result<(), LineReadError>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(bytes)
        .await
        .map_err(|e| LineReadError::IoError(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| LineReadError::IoError(e.to_string()))?;

    Ok(())
}
