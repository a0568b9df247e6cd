use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use muxrpc_common::{MuxrpcError, Result};
use tokio::time::Instant;

/// Circuit breaker state for each endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    /// Normal operation, calls flow through
    Closed,
    /// Circuit is tripped, calls fail fast without reaching the endpoint
    Open,
    /// Testing if the endpoint has recovered with a single probe call
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within `window` that trip the circuit.
    ///
    /// Default: 5
    pub failure_threshold: u32,

    /// Sliding window over which failures are counted.
    ///
    /// Default: 60s
    pub window: Duration,

    /// Time spent open before a probe is admitted.
    ///
    /// Default: 30s
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// How a call admitted by the breaker turned out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// The endpoint answered, even with an application error.
    Success,
    /// Transport or protocol failure, or the endpoint reported `UNAVAILABLE`.
    Failure,
    /// Says nothing about the endpoint: cancellation, local deadline,
    /// pool exhaustion, interceptor rejection.
    Neutral,
}

impl CallOutcome {
    pub fn classify<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => CallOutcome::Success,
            Err(err) => Self::classify_error(err),
        }
    }

    pub fn classify_error(err: &MuxrpcError) -> Self {
        if err.is_transport_failure() {
            CallOutcome::Failure
        } else if matches!(err, MuxrpcError::Remote(_)) {
            CallOutcome::Success
        } else {
            CallOutcome::Neutral
        }
    }
}

struct BreakerInner {
    state: CircuitBreakerState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    last_transition: Instant,
    probe_in_flight: bool,
}

/// Failure-rate gate for one endpoint.
///
/// All transitions happen under one lock, so concurrent callers racing for
/// the half-open probe see exactly one winner.
pub struct CircuitBreaker {
    endpoint: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitBreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                last_transition: Instant::now(),
                probe_in_flight: false,
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> CircuitBreakerState {
        self.lock().state
    }

    /// Failures currently inside the sliding window.
    pub fn failure_count(&self) -> usize {
        let mut inner = self.lock();
        self.prune(&mut inner, Instant::now());
        inner.failures.len()
    }

    pub fn last_transition(&self) -> Instant {
        self.lock().last_transition
    }

    /// Admits a call or fails fast with [`MuxrpcError::CircuitOpen`].
    ///
    /// An open circuit past its recovery timeout moves to half-open and
    /// admits the caller as its single probe.
    pub fn admit(self: &Arc<Self>) -> Result<BreakerPermit> {
        let mut inner = self.lock();
        let now = Instant::now();

        let probe = match inner.state {
            CircuitBreakerState::Closed => false,
            CircuitBreakerState::Open => {
                let recovered = inner
                    .opened_at
                    .map_or(true, |opened| now.saturating_duration_since(opened) >= self.config.recovery_timeout);
                if !recovered {
                    return Err(self.rejected());
                }
                self.transition(&mut inner, CircuitBreakerState::HalfOpen, now);
                inner.probe_in_flight = true;
                true
            }
            CircuitBreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(self.rejected());
                }
                inner.probe_in_flight = true;
                true
            }
        };

        Ok(BreakerPermit {
            breaker: self.clone(),
            probe,
            recorded: false,
        })
    }

    /// Closes the circuit and forgets all failures.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.failures.clear();
        inner.probe_in_flight = false;
        self.transition(&mut inner, CircuitBreakerState::Closed, Instant::now());
    }

    fn record(&self, probe: bool, outcome: CallOutcome) {
        let mut inner = self.lock();
        let now = Instant::now();

        if probe {
            inner.probe_in_flight = false;
            match outcome {
                CallOutcome::Success => {
                    inner.failures.clear();
                    self.transition(&mut inner, CircuitBreakerState::Closed, now);
                }
                CallOutcome::Failure => self.transition(&mut inner, CircuitBreakerState::Open, now),
                CallOutcome::Neutral => {}
            }
            return;
        }

        // Outcomes of calls admitted before the circuit tripped only count
        // while it is still closed.
        if inner.state != CircuitBreakerState::Closed || outcome != CallOutcome::Failure {
            return;
        }
        inner.failures.push_back(now);
        self.prune(&mut inner, now);
        if inner.failures.len() >= self.config.failure_threshold.max(1) as usize {
            self.transition(&mut inner, CircuitBreakerState::Open, now);
        }
    }

    fn prune(&self, inner: &mut BreakerInner, now: Instant) {
        while let Some(oldest) = inner.failures.front() {
            if now.saturating_duration_since(*oldest) >= self.config.window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitBreakerState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.last_transition = now;
        inner.opened_at = match to {
            CircuitBreakerState::Open => Some(now),
            CircuitBreakerState::Closed | CircuitBreakerState::HalfOpen => None,
        };
        if from == to && to != CircuitBreakerState::Open {
            return;
        }
        match to {
            CircuitBreakerState::Open => tracing::warn!(
                endpoint = %self.endpoint,
                ?from,
                failures = inner.failures.len(),
                "circuit opened"
            ),
            CircuitBreakerState::HalfOpen => {
                tracing::info!(endpoint = %self.endpoint, "circuit half-open, admitting probe")
            }
            CircuitBreakerState::Closed => tracing::info!(endpoint = %self.endpoint, ?from, "circuit closed"),
        }
    }

    fn rejected(&self) -> MuxrpcError {
        MuxrpcError::CircuitOpen(self.endpoint.clone())
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

/// Admission for one call. Report its outcome with [`record`](Self::record).
///
/// Dropping the permit unrecorded counts as [`CallOutcome::Neutral`].
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    recorded: bool,
}

impl BreakerPermit {
    /// True if this call is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record(mut self, outcome: CallOutcome) {
        self.recorded = true;
        self.breaker.record(self.probe, outcome);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.recorded {
            self.breaker.record(self.probe, CallOutcome::Neutral);
        }
    }
}

impl std::fmt::Debug for BreakerPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerPermit")
            .field("endpoint", &self.breaker.endpoint)
            .field("probe", &self.probe)
            .finish()
    }
}

/// One breaker per endpoint, created on first use and kept for the life
/// of the client.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(endpoint, self.config.clone())))
            .clone()
    }

    /// State for `endpoint`. Endpoints never called are closed.
    pub fn state(&self, endpoint: &str) -> CircuitBreakerState {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .get(endpoint)
            .map_or(CircuitBreakerState::Closed, |b| b.state())
    }
}
