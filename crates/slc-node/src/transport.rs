//! Byte-stream transport over TCP sockets and FIFOs.
//!
//! Both endpoint kinds present the same exact-transfer contract:
//! - `read_exact(n)` returns exactly `n` bytes or fails; a peer closing early
//!   yields [`TransportError::ShortRead`], never a short buffer
//! - `write_exact(bytes)` writes and flushes everything or fails
//! - `close()` may be called any number of times
//!
//! Endpoints are described by strings: `host:port` for TCP, a filesystem
//! path for a FIFO (`r:` / `w:` prefix selects the direction, default read).
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Buffers are addressed through `get_mut`, never by direct indexing

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, trace};

use slc_core::{Fault, FaultKind};

/// Default bound on opening an endpoint.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between attempts to open a FIFO that has no reader yet.
const FIFO_RETRY_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The endpoint could not be opened within the connect timeout.
    #[error("cannot connect to {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },

    /// The peer closed the stream before `expected` bytes arrived.
    #[error("short read: expected {expected} bytes, got {received}")]
    ShortRead { expected: usize, received: usize },

    /// Transport fault while reading or writing.
    #[error("I/O error: {0}")]
    Io(String),

    /// The operation does not apply to this endpoint (e.g. writing a read-only FIFO).
    #[error("{op} not supported on {endpoint}")]
    Unsupported { op: &'static str, endpoint: String },

    /// The endpoint descriptor could not be parsed.
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    /// The connection was closed locally.
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::Connection { .. } => FaultKind::Connection,
            Self::ShortRead { .. } => FaultKind::ShortRead,
            Self::Io(_) | Self::Unsupported { .. } | Self::Closed => FaultKind::Io,
            Self::InvalidEndpoint(_) => FaultKind::Config,
        }
    }
}

impl From<TransportError> for Fault {
    fn from(err: TransportError) -> Self {
        Fault::new(err.kind(), err.to_string())
    }
}

// ============================================================================
// Endpoints
// ============================================================================

/// Direction a FIFO is opened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoAccess {
    Read,
    Write,
}

/// Where a connection goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Fifo { path: PathBuf, access: FifoAccess },
}

impl Endpoint {
    /// Parses an endpoint descriptor.
    ///
    /// ```
    /// use slc_node::transport::{Endpoint, FifoAccess};
    ///
    /// let tcp = Endpoint::parse("hvcrate01:5000").unwrap();
    /// assert!(matches!(tcp, Endpoint::Tcp { port: 5000, .. }));
    ///
    /// let fifo = Endpoint::parse("w:/run/slc/hv.fifo").unwrap();
    /// assert!(matches!(fifo, Endpoint::Fifo { access: FifoAccess::Write, .. }));
    /// ```
    pub fn parse(descriptor: &str) -> Result<Self, TransportError> {
        let descriptor = descriptor.trim();
        let invalid = || TransportError::InvalidEndpoint(descriptor.to_string());

        if descriptor.contains('/') {
            let (access, path) = match descriptor.split_once(':') {
                Some(("r", path)) => (FifoAccess::Read, path),
                Some(("w", path)) => (FifoAccess::Write, path),
                _ => (FifoAccess::Read, descriptor),
            };
            if path.is_empty() {
                return Err(invalid());
            }
            return Ok(Self::Fifo {
                path: PathBuf::from(path),
                access,
            });
        }

        let (host, port) = descriptor.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse().map_err(|_| invalid())?;
        Ok(Self::Tcp {
            host: host.to_string(),
            port,
        })
    }

    fn can_read(&self) -> bool {
        !matches!(
            self,
            Self::Fifo {
                access: FifoAccess::Write,
                ..
            }
        )
    }

    fn can_write(&self) -> bool {
        !matches!(
            self,
            Self::Fifo {
                access: FifoAccess::Read,
                ..
            }
        )
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
            Self::Fifo {
                path,
                access: FifoAccess::Read,
            } => write!(f, "r:{}", path.display()),
            Self::Fifo {
                path,
                access: FifoAccess::Write,
            } => write!(f, "w:{}", path.display()),
        }
    }
}

// ============================================================================
// Exact-transfer building blocks
// ============================================================================

/// Reads exact byte counts from any async byte source.
pub struct StreamReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads exactly `n` bytes.
    ///
    /// # Errors
    ///
    /// - `TransportError::ShortRead` if the stream ends first
    /// - `TransportError::Io` on any other fault
    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; n];
        let mut filled = 0;

        while filled < n {
            let Some(rest) = buf.get_mut(filled..) else {
                break;
            };
            match self.inner.read(rest).await {
                Ok(0) => {
                    return Err(TransportError::ShortRead {
                        expected: n,
                        received: filled,
                    })
                }
                Ok(read) => {
                    filled += read;
                    trace!(read, filled, expected = n, "Partial read");
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Io(e.to_string())),
            }
        }

        Ok(buf)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writes whole buffers to any async byte sink.
pub struct StreamWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes all of `bytes` and flushes.
    pub async fn write_exact(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.inner
            .write_all(bytes)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        self.inner
            .flush()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    /// Shuts the sink down; errors are ignored.
    pub async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

type BoxedReader = StreamReader<Box<dyn AsyncRead + Send + Unpin>>;
type BoxedWriter = StreamWriter<Box<dyn AsyncWrite + Send + Unpin>>;

// ============================================================================
// Connection
// ============================================================================

/// An open endpoint with exact-transfer semantics.
pub struct Connection {
    endpoint: Endpoint,
    reader: Option<BoxedReader>,
    writer: Option<BoxedWriter>,
    closed: bool,
}

impl Connection {
    fn new(endpoint: Endpoint, reader: Option<BoxedReader>, writer: Option<BoxedWriter>) -> Self {
        Self {
            endpoint,
            reader,
            writer,
            closed: false,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_readable(&self) -> bool {
        !self.closed && self.endpoint.can_read()
    }

    pub fn is_writable(&self) -> bool {
        !self.closed && self.endpoint.can_write()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Reads exactly `n` bytes.
    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match self.reader.as_mut() {
            Some(reader) => reader.read_exact(n).await,
            None => Err(TransportError::Unsupported {
                op: "read",
                endpoint: self.endpoint.to_string(),
            }),
        }
    }

    /// Writes all of `bytes`.
    pub async fn write_exact(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match self.writer.as_mut() {
            Some(writer) => writer.write_exact(bytes).await,
            None => Err(TransportError::Unsupported {
                op: "write",
                endpoint: self.endpoint.to_string(),
            }),
        }
    }

    /// Closes the connection. Calling it again is a no-op.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await;
        }
        self.reader = None;
        debug!(endpoint = %self.endpoint, "Connection closed");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Opens `endpoint`, bounded by [`CONNECT_TIMEOUT`].
pub async fn connect(endpoint: &Endpoint) -> Result<Connection, TransportError> {
    connect_with_timeout(endpoint, CONNECT_TIMEOUT).await
}

/// Opens `endpoint`, giving up after `limit`.
pub async fn connect_with_timeout(
    endpoint: &Endpoint,
    limit: Duration,
) -> Result<Connection, TransportError> {
    let failed = |reason: String| TransportError::Connection {
        endpoint: endpoint.to_string(),
        reason,
    };

    let conn = match endpoint {
        Endpoint::Tcp { host, port } => {
            let stream = timeout(limit, TcpStream::connect((host.as_str(), *port)))
                .await
                .map_err(|_| failed(format!("timed out after {limit:?}")))?
                .map_err(|e| failed(e.to_string()))?;
            let _ = stream.set_nodelay(true);
            let (reader, writer) = stream.into_split();
            Connection::new(
                endpoint.clone(),
                Some(StreamReader::new(Box::new(reader))),
                Some(StreamWriter::new(Box::new(writer))),
            )
        }
        Endpoint::Fifo {
            path,
            access: FifoAccess::Read,
        } => {
            let receiver = pipe::OpenOptions::new()
                .open_receiver(path)
                .map_err(|e| failed(e.to_string()))?;
            Connection::new(
                endpoint.clone(),
                Some(StreamReader::new(Box::new(receiver))),
                None,
            )
        }
        Endpoint::Fifo {
            path,
            access: FifoAccess::Write,
        } => {
            let sender = open_fifo_sender(path, limit).await.map_err(failed)?;
            Connection::new(
                endpoint.clone(),
                None,
                Some(StreamWriter::new(Box::new(sender))),
            )
        }
    };

    debug!(endpoint = %endpoint, "Connected");
    Ok(conn)
}

/// Opens the write side of a FIFO, retrying while it has no reader.
async fn open_fifo_sender(path: &Path, limit: Duration) -> Result<pipe::Sender, String> {
    let deadline = Instant::now() + limit;
    loop {
        match pipe::OpenOptions::new().open_sender(path) {
            Ok(sender) => return Ok(sender),
            // ENXIO: no reader has the FIFO open yet
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                if Instant::now() >= deadline {
                    return Err(format!("no reader after {limit:?}"));
                }
                sleep(FIFO_RETRY_INTERVAL).await;
            }
            Err(e) => return Err(e.to_string()),
        }
    }
}
