//! Transport abstraction.
//!
//! A session needs reliable, ordered, connection-oriented byte delivery.
//! [`Transport::recv`] returns the next chunk of the byte stream; chunk
//! boundaries carry no meaning and the session reassembles packets itself.
//!
//! Two implementations ship with the crate:
//! - [`TcpTransport`] over `tokio::net::TcpStream`
//! - [`LoopbackTransport`], an in-memory connected pair

use async_trait::async_trait;
use std::io;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};

/// Read buffer size for stream transports
const READ_CHUNK: usize = 64 * 1024;

/// Loopback channel depth, in chunks
const LOOPBACK_DEPTH: usize = 1024;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Operation did not complete in time
    #[error("Transport operation timed out")]
    Timeout,

    /// Remote end refused the connection
    #[error("Connection refused: {0}")]
    Refused(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// No connection established yet
    #[error("Transport is not connected")]
    NotConnected,

    /// Transport-specific error
    #[error("Transport error: {0}")]
    Other(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Async, connection-oriented byte transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to `address`, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Timeout`] when the deadline passes and
    /// [`TransportError::Refused`] when the remote end refuses.
    async fn connect(&self, address: &str, timeout: Duration) -> TransportResult<()>;

    /// Write all of `data`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] or an I/O error.
    async fn send(&self, data: &[u8]) -> TransportResult<()>;

    /// Read the next chunk of the stream.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] once the remote end has closed.
    async fn recv(&self) -> TransportResult<Vec<u8>>;

    /// Close the connection. Subsequent sends fail.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if shutdown fails.
    async fn disconnect(&self) -> TransportResult<()>;

    /// Check if the transport is connected
    fn is_connected(&self) -> bool;

    /// Get transport statistics (optional).
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Chunks sent
    pub chunks_sent: u64,
    /// Chunks received
    pub chunks_received: u64,
}

impl TransportStats {
    /// Record a successful send
    pub fn record_send(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.chunks_sent += 1;
    }

    /// Record a successful receive
    pub fn record_recv(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.chunks_received += 1;
    }
}

// ============================================================================
// TCP
// ============================================================================

/// TCP stream transport.
#[derive(Debug, Default)]
pub struct TcpTransport {
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    connected: AtomicBool,
    stats: StdMutex<TransportStats>,
}

impl TcpTransport {
    /// Create an unconnected transport
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an accepted stream
    #[must_use]
    pub fn from_stream(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            connected: AtomicBool::new(true),
            stats: StdMutex::new(TransportStats::default()),
        }
    }

    fn record(&self, update: impl FnOnce(&mut TransportStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            update(&mut stats);
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, address: &str, timeout: Duration) -> TransportResult<()> {
        if self.is_connected() {
            return Err(TransportError::ConnectionFailed("already connected".into()));
        }

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Err(_) => return Err(TransportError::Timeout),
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                return Err(TransportError::Refused(format!("{address}: {e}")));
            }
            Ok(Err(e)) => return Err(TransportError::Io(e)),
            Ok(Ok(stream)) => stream,
        };
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::Release);
        tracing::debug!("TCP transport connected to {}", address);
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> TransportResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;
        writer.write_all(data).await?;
        self.record(|s| s.record_send(data.len()));
        Ok(())
    }

    async fn recv(&self) -> TransportResult<Vec<u8>> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let mut buf = vec![0u8; READ_CHUNK];
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            self.connected.store(false, Ordering::Release);
            return Err(TransportError::Closed);
        }
        buf.truncate(n);
        self.record(|s| s.record_recv(n));
        Ok(buf)
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.connected.store(false, Ordering::Release);
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn stats(&self) -> TransportStats {
        self.stats.lock().map(|s| *s).unwrap_or_default()
    }
}

// ============================================================================
// Loopback
// ============================================================================

/// One end of an in-memory connected pair.
#[derive(Debug)]
pub struct LoopbackTransport {
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    connected: AtomicBool,
    stats: StdMutex<TransportStats>,
}

impl LoopbackTransport {
    /// Create two connected ends
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(LOOPBACK_DEPTH);
        let (b_tx, a_rx) = mpsc::channel(LOOPBACK_DEPTH);
        (Self::end(a_tx, a_rx), Self::end(b_tx, b_rx))
    }

    fn end(tx: mpsc::Sender<Vec<u8>>, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            connected: AtomicBool::new(true),
            stats: StdMutex::new(TransportStats::default()),
        }
    }

    fn record(&self, update: impl FnOnce(&mut TransportStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            update(&mut stats);
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self, _address: &str, _timeout: Duration) -> TransportResult<()> {
        if self.tx.lock().await.is_none() {
            return Err(TransportError::ConnectionFailed(
                "loopback transport cannot reconnect".into(),
            ));
        }
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> TransportResult<()> {
        let guard = self.tx.lock().await;
        let tx = guard.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(data.to_vec())
            .await
            .map_err(|_| TransportError::Closed)?;
        self.record(|s| s.record_send(data.len()));
        Ok(())
    }

    async fn recv(&self) -> TransportResult<Vec<u8>> {
        let chunk = self.rx.lock().await.recv().await;
        match chunk {
            Some(chunk) => {
                self.record(|s| s.record_recv(chunk.len()));
                Ok(chunk)
            }
            None => {
                self.connected.store(false, Ordering::Release);
                Err(TransportError::Closed)
            }
        }
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.connected.store(false, Ordering::Release);
        self.tx.lock().await.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn stats(&self) -> TransportStats {
        self.stats.lock().map(|s| *s).unwrap_or_default()
    }
}
