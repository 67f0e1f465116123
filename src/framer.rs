//! Byte-stream framer.
//!
//! The broker speaks over plain TCP, which delivers arbitrary chunk
//! boundaries. [`PacketStream`] keeps one receive buffer per connection and
//! cuts packets out of it three ways:
//!
//! ```text
//! read_until(b"\r\n")  ──► everything up to and including the delimiter
//! read_exact(n)        ──► exactly n bytes
//! read_until_close()   ──► everything until the peer half-closes
//! ```
//!
//! Delivered bytes are dropped from the buffer; anything past the packet
//! stays buffered for the next call. Every read is bounded by a deadline that
//! is re-checked each time more bytes are requested from the transport.
//!
//! Rust guideline compliant 2025-01

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Default deadline for a single framer read.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(50);

/// Bytes requested from the transport per read.
const READ_CHUNK: usize = 8 * 1024;

/// Byte transport the framer runs over.
///
/// Implemented for anything that is an async reader and writer, so a
/// `TcpStream` in production and a `DuplexStream` in tests both qualify.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Packetizing wrapper around a [`Transport`].
#[derive(Debug)]
pub struct PacketStream<S> {
    stream: S,
    buf: BytesMut,
    timeout: Duration,
}

impl<S: Transport> PacketStream<S> {
    /// Wrap `stream` with the default 50 second read deadline.
    pub fn new(stream: S) -> Self {
        Self::with_timeout(stream, DEFAULT_READ_TIMEOUT)
    }

    /// Wrap `stream` with a custom read deadline.
    pub fn with_timeout(stream: S, timeout: Duration) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(READ_CHUNK),
            timeout,
        }
    }

    /// Read deadline applied to each framer call.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Change the read deadline for subsequent calls.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Number of received bytes not yet delivered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Wait until `n` bytes are available, then return and consume them.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] if the deadline passes, [`Error::Closed`] if the
    /// peer closes the stream first.
    pub async fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        let deadline = Instant::now() + self.timeout;
        while self.buf.len() < n {
            if self.fill(deadline).await? == 0 {
                return Err(Error::Closed);
            }
        }
        Ok(self.buf.split_to(n).freeze())
    }

    /// Wait until `delimiter` appears, then return everything up to and
    /// including it. Only that prefix is consumed.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] if the deadline passes, [`Error::Closed`] if the
    /// peer closes the stream first.
    pub async fn read_until(&mut self, delimiter: &[u8]) -> Result<Bytes> {
        if delimiter.is_empty() {
            return Err(Error::InvalidArgument("empty packet delimiter".to_string()));
        }
        let deadline = Instant::now() + self.timeout;
        // Bytes before `scan_from` are known not to start a match.
        let mut scan_from = 0;
        loop {
            if let Some(pos) = find(&self.buf[scan_from..], delimiter) {
                let end = scan_from + pos + delimiter.len();
                return Ok(self.buf.split_to(end).freeze());
            }
            scan_from = self.buf.len().saturating_sub(delimiter.len() - 1);
            if self.fill(deadline).await? == 0 {
                return Err(Error::Closed);
            }
        }
    }

    /// Accumulate everything until the peer half-closes the stream.
    ///
    /// A transport error after some output has arrived ends the capture the
    /// same way a clean close does.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] if the peer keeps the stream open past the deadline.
    pub async fn read_until_close(&mut self) -> Result<Bytes> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.fill(deadline).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(Error::Io(e)) => {
                    log::debug!("[Framer] Treating read error as close: {e}");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(self.buf.split().freeze())
    }

    /// Write `data` to the transport and flush it.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Half-close the write side of the transport.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Request more bytes from the transport, bounded by `deadline`.
    ///
    /// Returns the number of bytes appended (0 on EOF).
    async fn fill(&mut self, deadline: Instant) -> Result<usize> {
        if Instant::now() >= deadline {
            return Err(Error::Timeout(self.timeout));
        }
        self.buf.reserve(READ_CHUNK);
        match tokio::time::timeout_at(deadline, self.stream.read_buf(&mut self.buf)).await {
            Ok(read) => Ok(read?),
            Err(_) => Err(Error::Timeout(self.timeout)),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
