//! Suspending socket channel.
//!
//! Wraps a non-blocking stream and exposes connect, read, write and close as
//! `async fn`s, so per-connection protocol code reads as a sequence of
//! suspension points instead of completion callbacks. The channel knows
//! nothing about the wire protocol.

use bytes::BytesMut;
use log::debug;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// I/O failures surfaced by [`SuspendingChannel`].
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("Read failed: {0}")]
    Read(#[source] io::Error),

    #[error("Write failed: {0}")]
    Write(#[source] io::Error),

    #[error("Read timed out after {0:?}")]
    Timeout(Duration),

    #[error("Channel is closed")]
    Closed,
}

pub type ChannelResult<T> = std::result::Result<T, ChannelError>;

/// Result of a successful read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Number of bytes appended to the buffer.
    Data(usize),
    /// The peer closed its write half.
    EndOfStream,
}

pub struct SuspendingChannel<S = TcpStream> {
    stream: Option<S>,
    read_timeout: Option<Duration>,
    connected: bool,
}

impl SuspendingChannel<TcpStream> {
    /// Creates an unconnected TCP channel. Call [`connect`](Self::connect) before reading.
    pub fn new(read_timeout: Option<Duration>) -> Self {
        Self {
            stream: None,
            read_timeout,
            connected: false,
        }
    }

    pub async fn connect(&mut self, addr: SocketAddr) -> ChannelResult<()> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(ChannelError::Connect)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }
        self.stream = Some(stream);
        self.connected = true;
        Ok(())
    }
}

impl<S> SuspendingChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a stream that is already connected, e.g. one returned by `accept`.
    pub fn from_stream(stream: S, read_timeout: Option<Duration>) -> Self {
        Self {
            stream: Some(stream),
            read_timeout,
            connected: true,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Reads whatever bytes are available and appends them to `buf`.
    ///
    /// Suspends until data arrives, the peer closes, or the read timeout
    /// elapses. Only the calling task waits; other connections keep running.
    pub async fn read(&mut self, buf: &mut BytesMut) -> ChannelResult<ReadOutcome> {
        let stream = self.stream.as_mut().ok_or(ChannelError::Closed)?;

        let n = match self.read_timeout {
            Some(limit) => tokio::time::timeout(limit, stream.read_buf(buf))
                .await
                .map_err(|_| ChannelError::Timeout(limit))?,
            None => stream.read_buf(buf).await,
        }
        .map_err(ChannelError::Read)?;

        if n == 0 {
            Ok(ReadOutcome::EndOfStream)
        } else {
            Ok(ReadOutcome::Data(n))
        }
    }

    /// Writes the whole buffer and flushes it, returning the number of bytes written.
    pub async fn write(&mut self, buf: &[u8]) -> ChannelResult<usize> {
        let stream = self.stream.as_mut().ok_or(ChannelError::Closed)?;
        stream.write_all(buf).await.map_err(ChannelError::Write)?;
        stream.flush().await.map_err(ChannelError::Write)?;
        Ok(buf.len())
    }

    /// Shuts the stream down and releases it. Idempotent and infallible.
    pub async fn close(&mut self) {
        self.connected = false;
        if let Some(mut stream) = self.stream.take() {
            // Dropping the stream releases the read half.
            if let Err(e) = stream.shutdown().await {
                debug!("Ignoring error during channel shutdown: {}", e);
            }
        }
    }
}
