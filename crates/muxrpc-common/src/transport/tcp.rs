use std::time::Duration;

use tokio::net::TcpStream;

use crate::protocol::error::{MuxrpcError, Result};

/// Default timeout for establishing a TCP connection (5 seconds)
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP transport for muxrpc.
///
/// Resolves an endpoint and dials it. The resulting stream is handed to a
/// [`Multiplexer`](crate::transport::Multiplexer), which owns all further
/// reads and writes.
///
/// # Example
///
/// ```no_run
/// use muxrpc_common::transport::{Multiplexer, MuxConfig, TcpTransport};
///
/// # async fn demo() -> muxrpc_common::Result<()> {
/// let transport = TcpTransport::new();
/// let stream = transport.connect("127.0.0.1:7000").await?;
/// let mux = Multiplexer::client(stream, MuxConfig::default());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Connects to a remote endpoint.
    ///
    /// The address may resolve to several socket addresses; each is tried in
    /// turn until one accepts.
    ///
    /// # Arguments
    ///
    /// * `addr` - The address to connect to (e.g., "127.0.0.1:7000")
    ///
    /// # Errors
    ///
    /// Returns [`MuxrpcError::Transport`] if the address cannot be resolved or
    /// every resolved address refuses or times out.
    pub async fn connect(&self, addr: &str) -> Result<TcpStream> {
        let socket_addrs = tokio::net::lookup_host(addr)
            .await
            .map_err(|e| MuxrpcError::Transport(format!("Invalid address '{}': {}", addr, e)))?;

        let mut last_err = None;
        for socket_addr in socket_addrs {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(socket_addr)).await {
                Ok(Ok(stream)) => {
                    // Frames are small and latency sensitive.
                    stream
                        .set_nodelay(true)
                        .map_err(|e| Self::map_io_error(e, "set_nodelay"))?;
                    tracing::debug!(%socket_addr, "connected");
                    return Ok(stream);
                }
                Ok(Err(e)) => last_err = Some(Self::map_io_error(e, &format!("connect {socket_addr}"))),
                Err(_) => {
                    last_err = Some(MuxrpcError::Transport(format!(
                        "connect {} timed out after {}ms",
                        socket_addr,
                        self.connect_timeout.as_millis()
                    )))
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            MuxrpcError::Transport(format!("No addresses resolved for '{}'", addr))
        }))
    }

    /// Maps IO errors onto transport errors so callers see a retryable failure.
    pub fn map_io_error(err: std::io::Error, context: &str) -> MuxrpcError {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                MuxrpcError::Transport(format!("{}: timed out", context))
            }
            std::io::ErrorKind::ConnectionRefused => {
                MuxrpcError::Transport(format!("{}: connection refused", context))
            }
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::NotConnected => {
                MuxrpcError::Transport(format!("{}: connection lost", context))
            }
            _ => MuxrpcError::Io(err),
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}
