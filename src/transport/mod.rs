use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::clock::Clock;
use crate::device::DeviceError;

/// Address and port of the meter's stream service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.address, self.port)
    }
}

/// Establishes and tears down stream connections to the meter.
pub trait Connector: Send + Sync {
    type Conn: Send;

    /// Make one connection attempt.
    fn connect(&self, endpoint: &Endpoint)
        -> impl Future<Output = io::Result<Self::Conn>> + Send;

    /// Close a connection.
    fn close(&self, conn: Self::Conn) -> impl Future<Output = io::Result<()>> + Send;
}

impl<T: Connector> Connector for Arc<T> {
    type Conn = T::Conn;

    fn connect(&self, endpoint: &Endpoint)
        -> impl Future<Output = io::Result<Self::Conn>> + Send {
        (**self).connect(endpoint)
    }

    fn close(&self, conn: Self::Conn) -> impl Future<Output = io::Result<()>> + Send {
        (**self).close(conn)
    }
}

/// Stream connection whose reads fail once they stall past a timeout.
#[derive(Debug)]
pub struct Connection<S = TcpStream> {
    stream: S,
    read_timeout: Duration,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, read_timeout: Duration) -> Self {
        Self {
            stream,
            read_timeout,
        }
    }

    /// Fill `buf` completely.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), DeviceError> {
        match tokio::time::timeout(self.read_timeout, self.stream.read_exact(buf)).await {
            Err(_) => Err(DeviceError::Timeout(self.read_timeout)),
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Err(DeviceError::Closed),
            Ok(Err(e)) => Err(DeviceError::Io(e)),
            Ok(Ok(_)) => Ok(()),
        }
    }

    /// Write all of `buf` and flush it.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), DeviceError> {
        self.stream.write_all(buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Shut down the write half.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

/// Connector for meters reachable as a TCP stream service
/// (for example an RFCOMM-to-TCP bridge).
#[derive(Debug, Clone)]
pub struct TcpConnector {
    read_timeout: Duration,
}

impl TcpConnector {
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }
}

impl Connector for TcpConnector {
    type Conn = Connection<TcpStream>;

    async fn connect(&self, endpoint: &Endpoint) -> io::Result<Self::Conn> {
        let stream = TcpStream::connect((endpoint.address.as_str(), endpoint.port)).await?;
        stream.set_nodelay(true)?;
        Ok(Connection::new(stream, self.read_timeout))
    }

    async fn close(&self, mut conn: Self::Conn) -> io::Result<()> {
        conn.shutdown().await
    }
}

/// Connect to `endpoint`, retrying forever with a fixed `backoff`.
///
/// Returns `None` only when `cancel` fires.
pub async fn connect_with_retry<T, C>(
    connector: &T,
    endpoint: &Endpoint,
    backoff: Duration,
    clock: &C,
    cancel: &CancellationToken,
) -> Option<T::Conn>
where
    T: Connector,
    C: Clock,
{
    loop {
        info!(%endpoint, "connecting...");

        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            attempt = connector.connect(endpoint) => attempt,
        };

        match attempt {
            Ok(conn) => {
                info!(%endpoint, "connected");
                return Some(conn);
            }
            Err(e) => {
                error!(
                    address = %endpoint.address,
                    port = endpoint.port,
                    error = %e,
                    retry_in = ?backoff,
                    "failed to connect",
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    _ = clock.sleep(backoff) => {}
                }
            }
        }
    }
}
