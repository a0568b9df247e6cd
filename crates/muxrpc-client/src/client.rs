use std::sync::Arc;

use bytes::Bytes;
use muxrpc_common::{Metadata, MethodDescriptor, MuxrpcError, Result, Status, StatusCode};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::breaker::{BreakerPermit, BreakerRegistry, CallOutcome, CircuitBreaker, CircuitBreakerState};
use crate::config::{CallOptions, ClientConfig};
use crate::connection::{Connector, TcpConnector};
use crate::dispatcher::{Call, CallState, Dispatcher};
use crate::interceptor::{CallContext, Interceptor, InterceptorChain, InterceptorPipeline};
use crate::pool::{ConnectionLease, ConnectionPool};

/// muxrpc client for making calls to any number of endpoints.
///
/// Every call runs the interceptor pipeline, is gated by the endpoint's
/// circuit breaker, leases a slot on a pooled connection and is driven by
/// the dispatcher. Failed unary calls are retried per the active
/// [`RetryPolicy`](crate::RetryPolicy).
///
/// Cloning is cheap; clones share the pool, breakers and interceptors.
/// Must be created inside a tokio runtime.
///
/// # Example
///
/// ```no_run
/// use bytes::Bytes;
/// use muxrpc_client::{CallOptions, Client, ClientConfig};
/// use std::time::Duration;
///
/// # async fn demo() -> muxrpc_common::Result<()> {
/// let client = Client::new(ClientConfig::default());
/// let options = CallOptions::new()
///     .with_timeout(Duration::from_secs(2))
///     .with_metadata("authorization", "Bearer abc");
/// let response = client
///     .invoke("127.0.0.1:7000", "echo", Bytes::from_static(b"hello"), options)
///     .await?;
/// assert_eq!(response, Bytes::from_static(b"hello"));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    pool: ConnectionPool,
    breakers: BreakerRegistry,
    pipeline: InterceptorPipeline,
    dispatcher: Dispatcher,
}

impl Client {
    /// Creates a client that dials endpoints over TCP.
    pub fn new(config: ClientConfig) -> Self {
        let connector = Arc::new(TcpConnector::new(config.mux.clone()));
        Self::with_connector(config, connector)
    }

    /// Creates a client that dials through `connector`.
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let pool = ConnectionPool::new(config.pool.clone(), connector);
        let breakers = BreakerRegistry::new(config.breaker.clone());
        Self {
            inner: Arc::new(ClientInner {
                config,
                pool,
                breakers,
                pipeline: InterceptorPipeline::new(),
                dispatcher: Dispatcher::new(),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Adds an interceptor to every subsequent call. Lower `order` runs
    /// first on the way out.
    pub fn register_interceptor(&self, interceptor: Interceptor, order: i32) {
        self.inner.pipeline.register(interceptor, order);
    }

    /// Makes a unary call and returns the response payload.
    ///
    /// Retryable failures are retried with backoff until the policy's
    /// attempts or the call's deadline run out. Every attempt is a fresh
    /// call: interceptors, breaker admission and pool acquisition run again.
    ///
    /// # Errors
    ///
    /// - [`MuxrpcError::Remote`] with the server's status
    /// - [`MuxrpcError::CircuitOpen`] when the endpoint's breaker is open
    /// - [`MuxrpcError::DeadlineExceeded`] when the deadline passed, or left
    ///   no room for another attempt
    /// - [`MuxrpcError::InterceptorRejected`] when an interceptor refused the call
    /// - transport and pool errors once retries are exhausted
    pub async fn invoke(
        &self,
        endpoint: &str,
        method: &str,
        request: Bytes,
        options: CallOptions,
    ) -> Result<Bytes> {
        let descriptor = MethodDescriptor::unary(method);
        let policy = options
            .retry_policy
            .as_ref()
            .unwrap_or(&self.inner.config.retry);
        let deadline = options.resolve_deadline(self.inner.config.default_timeout);

        let mut attempt = 1;
        loop {
            let result = self
                .attempt_unary(endpoint, &descriptor, request.clone(), &options.metadata, deadline, attempt)
                .await;
            let err = match result {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            if !policy.should_retry(attempt, &err) {
                return Err(err);
            }
            let delay = policy.next_delay(attempt);
            if deadline.is_some_and(|deadline| Instant::now() + delay >= deadline) {
                tracing::debug!(endpoint, method, attempt, error = %err, "no deadline budget left to retry");
                return Err(match err {
                    err @ MuxrpcError::DeadlineExceeded(_) => err,
                    other => MuxrpcError::DeadlineExceeded(format!(
                        "deadline exhausted after {attempt} attempts, last error: {other}"
                    )),
                });
            }

            tracing::warn!(
                endpoint,
                method,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying call"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt_unary(
        &self,
        endpoint: &str,
        descriptor: &MethodDescriptor,
        request: Bytes,
        metadata: &Metadata,
        deadline: Option<Instant>,
        attempt: u32,
    ) -> Result<Bytes> {
        let mut ctx = CallContext::new(endpoint, descriptor, metadata.clone(), attempt, deadline);
        let mut chain = self.inner.pipeline.snapshot();

        let result = match chain.run_outbound(&mut ctx) {
            Err(err) => Err(err),
            Ok(()) => match self.inner.breakers.get(endpoint).admit() {
                Err(err) => Err(err),
                Ok(permit) => {
                    let result = self
                        .unary_exchange(endpoint, descriptor, request, ctx.metadata.clone(), deadline)
                        .await;
                    permit.record(CallOutcome::classify(&result));
                    result
                }
            },
        };

        let status = match &result {
            Ok(_) => Status::ok(),
            Err(err) => err.status(),
        };
        match chain.run_inbound(&ctx, &status) {
            Ok(()) => result,
            Err(rejection) => Err(rejection),
        }
    }

    async fn unary_exchange(
        &self,
        endpoint: &str,
        descriptor: &MethodDescriptor,
        request: Bytes,
        metadata: Metadata,
        deadline: Option<Instant>,
    ) -> Result<Bytes> {
        let lease = self.acquire(endpoint, deadline).await?;
        let dispatcher = &self.inner.dispatcher;
        let mut call = dispatcher.start(lease, descriptor.clone(), deadline, metadata);

        dispatcher.send(&mut call, request).await?;
        let response = dispatcher.receive(&mut call).await?;
        let status = dispatcher.finish(&mut call).await;

        match response {
            Some(response) if status.is_ok() => Ok(response),
            None if status.is_ok() => Err(MuxrpcError::Remote(Status::internal(format!(
                "unary call {} completed without a response",
                call.id()
            )))),
            _ => Err(terminal_error(&call, status)),
        }
    }

    /// Leases a connection, giving up at the call's deadline.
    async fn acquire(&self, endpoint: &str, deadline: Option<Instant>) -> Result<ConnectionLease> {
        let pool = &self.inner.pool;
        let Some(deadline) = deadline else {
            return pool.acquire(endpoint).await;
        };
        tokio::select! {
            biased;
            lease = pool.acquire(endpoint) => lease,
            _ = tokio::time::sleep_until(deadline) => Err(MuxrpcError::DeadlineExceeded(format!(
                "deadline passed waiting for a connection to {endpoint}"
            ))),
        }
    }

    /// Opens a streaming call.
    ///
    /// Interceptors and the circuit breaker run once, here. Streams are
    /// never retried. The OPEN frame goes out with the first
    /// [`send`](StreamHandle::send) or [`next`](StreamHandle::next).
    pub async fn open_stream(
        &self,
        endpoint: &str,
        method: MethodDescriptor,
        options: CallOptions,
    ) -> Result<StreamHandle> {
        let deadline = options.resolve_deadline(self.inner.config.default_timeout);
        let mut ctx = CallContext::new(endpoint, &method, options.metadata, 1, deadline);
        let mut chain = self.inner.pipeline.snapshot();

        if let Err(err) = chain.run_outbound(&mut ctx) {
            return Err(rejected_early(&mut chain, &ctx, err));
        }
        let permit = match self.inner.breakers.get(endpoint).admit() {
            Ok(permit) => permit,
            Err(err) => return Err(rejected_early(&mut chain, &ctx, err)),
        };
        let lease = match self.acquire(endpoint, deadline).await {
            Ok(lease) => lease,
            Err(err) => {
                permit.record(CallOutcome::classify_error(&err));
                return Err(rejected_early(&mut chain, &ctx, err));
            }
        };

        let call = self
            .inner
            .dispatcher
            .start(lease, method, deadline, ctx.metadata.clone());
        Ok(StreamHandle {
            client: self.inner.clone(),
            call,
            ctx,
            chain,
            permit: Some(permit),
            outcome: None,
        })
    }

    pub fn circuit_state(&self, endpoint: &str) -> CircuitBreakerState {
        self.inner.breakers.state(endpoint)
    }

    /// The breaker for `endpoint`, e.g. to [`reset`](CircuitBreaker::reset) it.
    pub fn circuit_breaker(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        self.inner.breakers.get(endpoint)
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn interceptors(&self) -> &InterceptorPipeline {
        &self.inner.pipeline
    }

    /// Cancels every active call and shuts the pool down. Later calls fail
    /// with a transport error.
    pub fn shutdown(&self) {
        tracing::info!(active_calls = self.inner.dispatcher.active_calls(), "client shutting down");
        self.inner.dispatcher.cancel_all();
        self.inner.pool.shutdown();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("pool", &self.inner.pool)
            .field("interceptors", &self.inner.pipeline.names())
            .field("active_calls", &self.inner.dispatcher.active_calls())
            .finish()
    }
}

/// Runs inbound hooks for a call that never reached the dispatcher.
fn rejected_early(chain: &mut InterceptorChain, ctx: &CallContext, err: MuxrpcError) -> MuxrpcError {
    match chain.run_inbound(ctx, &err.status()) {
        Ok(()) => err,
        Err(rejection) => rejection,
    }
}

/// The error matching a finished call's non-`OK` status.
fn terminal_error(call: &Call, status: Status) -> MuxrpcError {
    match call.state() {
        CallState::Cancelled if status.code == StatusCode::DeadlineExceeded => {
            MuxrpcError::DeadlineExceeded(status.message)
        }
        CallState::Cancelled => MuxrpcError::Cancelled,
        _ => call
            .local_failure()
            .unwrap_or(MuxrpcError::Remote(status)),
    }
}

fn outcome_of(call: &Call) -> CallOutcome {
    match call.state() {
        CallState::Completed => CallOutcome::Success,
        CallState::Failed if call.failed_on_transport() => CallOutcome::Failure,
        CallState::Failed => CallOutcome::Success,
        CallState::Created | CallState::Active | CallState::Cancelled => CallOutcome::Neutral,
    }
}

/// Application handle for a streaming call.
///
/// `next` yields response messages until the server finishes. `close`
/// half-closes the request side. `finish` returns the final status.
/// Dropping an unfinished handle cancels the call.
pub struct StreamHandle {
    client: Arc<ClientInner>,
    call: Call,
    ctx: CallContext,
    chain: InterceptorChain,
    permit: Option<BreakerPermit>,
    outcome: Option<Status>,
}

impl StreamHandle {
    pub fn call_id(&self) -> u64 {
        self.call.id()
    }

    pub fn method(&self) -> &MethodDescriptor {
        self.call.method()
    }

    pub fn state(&self) -> CallState {
        self.call.state()
    }

    /// Cancelling the token from another task cancels the stream.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.call.cancellation_token()
    }

    /// Sends one request message, waiting for flow-control credit.
    pub async fn send(&mut self, message: Bytes) -> Result<()> {
        let result = self.client.dispatcher.send(&mut self.call, message).await;
        self.conclude(result)
    }

    /// Next response message, or `None` once the server finished with `OK`.
    pub async fn next(&mut self) -> Result<Option<Bytes>> {
        let result = self.client.dispatcher.receive(&mut self.call).await;
        self.conclude(result)
    }

    /// Half-closes the request side. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        let result = self.client.dispatcher.close_send(&mut self.call).await;
        self.conclude(result)
    }

    /// Cancels the stream. No-op once finished.
    pub fn cancel(&mut self) {
        self.client.dispatcher.cancel(&mut self.call);
        self.settle();
    }

    /// Final status of the stream. Half-closes and drains unread messages
    /// if the stream is still running. Repeated calls return the same
    /// status.
    pub async fn finish(&mut self) -> Status {
        let status = self.client.dispatcher.finish(&mut self.call).await;
        self.settle();
        self.outcome.clone().unwrap_or(status)
    }

    fn conclude<T>(&mut self, result: Result<T>) -> Result<T> {
        match self.settle() {
            Some(rejection) => Err(rejection),
            None => result,
        }
    }

    /// Once the call is terminal: reports the breaker outcome and runs
    /// inbound interceptors, exactly once. Returns an interceptor rejection.
    fn settle(&mut self) -> Option<MuxrpcError> {
        if self.outcome.is_some() || !self.call.state().is_terminal() {
            return None;
        }
        if let Some(permit) = self.permit.take() {
            permit.record(outcome_of(&self.call));
        }
        let status = self
            .call
            .final_status()
            .cloned()
            .unwrap_or_else(|| Status::internal("stream ended without a status"));
        match self.chain.run_inbound(&self.ctx, &status) {
            Ok(()) => {
                self.outcome = Some(status);
                None
            }
            Err(rejection) => {
                self.outcome = Some(rejection.status());
                Some(rejection)
            }
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if self.outcome.is_none() {
            self.client.dispatcher.cancel(&mut self.call);
            self.settle();
        }
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("call", &self.call)
            .field("endpoint", &self.ctx.endpoint)
            .finish()
    }
}
