use std::collections::HashSet;
use std::time::Duration;

use muxrpc_common::{MuxrpcError, StatusCode};
use rand::Rng;

/// When and how often failed unary calls are retried.
///
/// Streaming calls are never retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first. `1` disables retries.
    ///
    /// Default: 3
    pub max_attempts: u32,

    /// Delay before the second attempt.
    ///
    /// Default: 50ms
    pub initial_delay: Duration,

    /// Upper bound for any single delay, jitter included.
    ///
    /// Default: 5s
    pub max_delay: Duration,

    /// Growth factor applied per attempt.
    ///
    /// Default: 2.0
    pub multiplier: f64,

    /// Relative jitter in `[0, 1]`. A delay `d` becomes uniform in
    /// `[d * (1 - jitter), d * (1 + jitter)]`.
    ///
    /// Default: 0.2
    pub jitter: f64,

    /// Status codes worth retrying.
    ///
    /// Default: `UNAVAILABLE`, `DEADLINE_EXCEEDED`
    pub retryable: HashSet<StatusCode>,

    /// Whether interceptor rejections are retried when their code is
    /// retryable.
    ///
    /// Default: false
    pub retry_interceptor_rejections: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.2,
            retryable: StatusCode::ALL
                .into_iter()
                .filter(|code| code.is_retryable_by_default())
                .collect(),
            retry_interceptor_rejections: false,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes a single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retryable(mut self, codes: impl IntoIterator<Item = StatusCode>) -> Self {
        self.retryable = codes.into_iter().collect();
        self
    }

    /// Whether a call that failed `attempt` (1-based) times with `err`
    /// should be tried again.
    ///
    /// Cancellation, open circuits, protocol violations and local misuse
    /// are never retried.
    /// Interceptor rejections only when enabled.
    pub fn should_retry(&self, attempt: u32, err: &MuxrpcError) -> bool {
        if attempt >= self.max_attempts.max(1) {
            return false;
        }
        match err {
            MuxrpcError::Cancelled
            | MuxrpcError::CircuitOpen(_)
            | MuxrpcError::Protocol(_)
            | MuxrpcError::InvalidArgument(_)
            | MuxrpcError::InvalidCallState(_) => false,
            MuxrpcError::InterceptorRejected { status, .. } => {
                self.retry_interceptor_rejections && self.retryable.contains(&status.code)
            }
            other => self.retryable.contains(&other.code()),
        }
    }

    /// Delay before attempt `attempt + 1`, without jitter.
    ///
    /// `initial_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let delay = self.initial_delay.as_secs_f64() * factor;
        let max = self.max_delay.as_secs_f64();
        if !delay.is_finite() || delay >= max {
            self.max_delay
        } else {
            Duration::try_from_secs_f64(delay).unwrap_or(self.max_delay)
        }
    }

    /// Delay before attempt `attempt + 1`, jittered and capped.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let jitter = self.jitter.clamp(0.0, 1.0);
        let spread = if jitter > 0.0 {
            rand::rng().random_range(-jitter..=jitter)
        } else {
            0.0
        };
        self.jittered(attempt, spread)
    }

    /// `base_delay` scaled by `1 + spread`, capped at `max_delay`.
    fn jittered(&self, attempt: u32, spread: f64) -> Duration {
        let scaled = self.base_delay(attempt).as_secs_f64() * (1.0 + spread);
        let capped = scaled.clamp(0.0, self.max_delay.as_secs_f64());
        // `as_secs_f64` rounds up near `Duration::MAX`.
        Duration::try_from_secs_f64(capped)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
