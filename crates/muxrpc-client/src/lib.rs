//! MuxRPC Client Runtime
//!
//! Turns logical calls into delivery over a small set of pooled,
//! multiplexed connections.
//!
//! # Components
//!
//! - [`pool`] - per-endpoint connection pool with FIFO waiters and idle eviction
//! - [`dispatcher`] - call lifecycle: send, receive, cancel, finish
//! - [`interceptor`] - ordered hooks around every call; [`interceptors`] has built-ins
//! - [`retry`] - retry policy with jittered exponential backoff
//! - [`breaker`] - per-endpoint circuit breaker
//! - [`client`] - the application API, [`Client::invoke`] and [`Client::open_stream`]
//!
//! # Call Path
//!
//! ```text
//! invoke -> interceptors (out) -> breaker admit -> pool acquire -> dispatcher
//!        <- interceptors (in)  <- breaker record <- final status <-
//! ```
//!
//! Unary calls that fail with a retryable status go around again, each
//! attempt a fresh call, until the retry policy or the deadline is spent.

pub mod breaker;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod interceptor;
pub mod interceptors;
pub mod pool;
pub mod retry;

#[cfg(test)]
mod test_util;

pub use breaker::{
    BreakerPermit, BreakerRegistry, CallOutcome, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerState,
};
pub use client::{Client, StreamHandle};
pub use config::{CallOptions, ClientConfig};
pub use connection::{Connection, ConnectionState, Connector, TcpConnector};
pub use dispatcher::{Call, CallState, Dispatcher};
pub use interceptor::{CallContext, Interceptor, InterceptorChain, InterceptorPipeline};
pub use pool::{ConnectionLease, ConnectionPool, PoolConfig, PoolStats};
pub use retry::RetryPolicy;
