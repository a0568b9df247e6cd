use std::time::Duration;

use muxrpc_common::{Metadata, MuxConfig};
use tokio::time::Instant;

use crate::breaker::CircuitBreakerConfig;
use crate::pool::PoolConfig;
use crate::retry::RetryPolicy;

/// Client configuration.
///
/// # Example
///
/// ```
/// use muxrpc_client::{ClientConfig, RetryPolicy};
/// use std::time::Duration;
///
/// let mut config = ClientConfig::default();
/// config.pool.max_connections = 2;
/// config.retry = RetryPolicy::no_retry();
/// config.default_timeout = Some(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub pool: PoolConfig,
    pub mux: MuxConfig,
    pub breaker: CircuitBreakerConfig,
    /// Policy for calls that do not override it.
    pub retry: RetryPolicy,
    /// Deadline applied to calls that set neither a timeout nor a deadline.
    ///
    /// Default: 30s
    pub default_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            mux: MuxConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
            default_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Relative timeout, measured from when the call is issued.
    pub timeout: Option<Duration>,
    /// Absolute deadline. With a timeout too, the earlier one wins.
    pub deadline: Option<Instant>,
    pub metadata: Metadata,
    /// Overrides the client's retry policy for this call.
    pub retry_policy: Option<RetryPolicy>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.append(key, value);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// The call's absolute deadline. Falls back to `default_timeout` when
    /// the options set neither a timeout nor a deadline.
    pub(crate) fn resolve_deadline(&self, default_timeout: Option<Duration>) -> Option<Instant> {
        let now = Instant::now();
        let from_timeout = self.timeout.map(|timeout| now + timeout);
        match (self.deadline, from_timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(deadline), None) | (None, Some(deadline)) => Some(deadline),
            (None, None) => default_timeout.map(|timeout| now + timeout),
        }
    }
}
