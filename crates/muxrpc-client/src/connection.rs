use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use futures::FutureExt;
use muxrpc_common::transport::TcpTransport;
use muxrpc_common::{MuxConfig, MuxStream, Multiplexer, OpenHeader, Result};

/// Lifecycle of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Ready, with no calls leased.
    Idle,
    /// Being dialed.
    Connecting,
    /// Ready and carrying at least one call.
    Ready,
    /// The transport failed. The pool discards it once its calls drain.
    TransientFailure,
    /// Closed by the pool.
    Shutdown,
}

/// Establishes multiplexed connections to an endpoint.
///
/// The pool dials through this trait, so tests and embedders can supply
/// in-memory transports.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, Result<Multiplexer>>;
}

/// Dials endpoints over TCP.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    transport: TcpTransport,
    mux_config: MuxConfig,
}

impl TcpConnector {
    pub fn new(mux_config: MuxConfig) -> Self {
        Self {
            transport: TcpTransport::new(),
            mux_config,
        }
    }

    pub fn with_transport(mut self, transport: TcpTransport) -> Self {
        self.transport = transport;
        self
    }
}

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, Result<Multiplexer>> {
        async move {
            let stream = self.transport.connect(endpoint).await?;
            Ok(Multiplexer::client(stream, self.mux_config.clone()))
        }
        .boxed()
    }
}

/// One multiplexed transport to a single endpoint, owned by the pool.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    endpoint: String,
    mux: Multiplexer,
    shut_down: AtomicBool,
}

impl Connection {
    pub(crate) fn new(id: u64, endpoint: String, mux: Multiplexer) -> Self {
        Self {
            id,
            endpoint,
            mux,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn mux(&self) -> &Multiplexer {
        &self.mux
    }

    /// True while the connection can accept new calls.
    pub fn is_ready(&self) -> bool {
        !self.shut_down.load(Ordering::Acquire) && !self.mux.is_closed()
    }

    /// Transport health: `Ready`, `TransientFailure` or `Shutdown`.
    ///
    /// Whether a ready connection is idle is pool bookkeeping; see
    /// [`ConnectionPool::connection_states`](crate::ConnectionPool::connection_states).
    pub fn health(&self) -> ConnectionState {
        if self.shut_down.load(Ordering::Acquire) {
            ConnectionState::Shutdown
        } else if self.mux.is_closed() {
            ConnectionState::TransientFailure
        } else {
            ConnectionState::Ready
        }
    }

    pub(crate) async fn open(&self, header: OpenHeader) -> Result<MuxStream> {
        self.mux.open(header).await
    }

    pub(crate) fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            tracing::debug!(conn_id = self.id, endpoint = %self.endpoint, "closing connection");
            self.mux.close();
        }
    }
}
