use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use muxrpc_common::{
    CallKind, Inbound, Metadata, MethodDescriptor, MuxStream, MuxrpcError, OpenHeader, Result,
    Status, StatusCode,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::pool::ConnectionLease;

/// Lifecycle of a [`Call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Started, nothing sent or received yet.
    Created,
    /// At least one message went out or came in.
    Active,
    /// The server returned `OK`.
    Completed,
    /// Cancelled by the caller or by its deadline.
    Cancelled,
    /// The server returned an error status or the connection failed.
    Failed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallState::Completed | CallState::Cancelled | CallState::Failed
        )
    }
}

/// A failure raised on this side of the connection, kept so callers see
/// the same error kind after the call settled.
#[derive(Debug, Clone)]
enum LocalFailure {
    Transport(String),
    Protocol(String),
}

type ActiveCalls = Arc<Mutex<HashMap<u64, CancellationToken>>>;

fn lock(calls: &ActiveCalls) -> MutexGuard<'_, HashMap<u64, CancellationToken>> {
    calls.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a call from the dispatcher's table when the call goes away.
struct Registration {
    calls: ActiveCalls,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        lock(&self.calls).remove(&self.id);
    }
}

/// One in-flight call on a leased connection.
///
/// The OPEN frame goes out on the first send or receive. Dropping a call
/// that has not finished cancels it and returns its lease.
pub struct Call {
    id: u64,
    method: MethodDescriptor,
    endpoint: String,
    deadline: Option<Instant>,
    metadata: Metadata,
    cancel: CancellationToken,
    state: CallState,
    stream: Option<MuxStream>,
    lease: Option<ConnectionLease>,
    registration: Option<Registration>,
    sent: usize,
    received: usize,
    send_closed: bool,
    final_status: Option<Status>,
    transport_failure: bool,
    local_failure: Option<LocalFailure>,
}

impl Call {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    pub fn kind(&self) -> CallKind {
        self.method.kind
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// The final status, once the call reached a terminal state.
    pub fn final_status(&self) -> Option<&Status> {
        self.final_status.as_ref()
    }

    /// True if the call ended because its connection or endpoint failed.
    pub fn failed_on_transport(&self) -> bool {
        self.transport_failure
    }

    /// The transport or protocol error that ended the call, if it ended
    /// on this side rather than with a status from the server.
    pub fn local_failure(&self) -> Option<MuxrpcError> {
        self.local_failure.as_ref().map(|failure| match failure {
            LocalFailure::Transport(reason) => MuxrpcError::Transport(reason.clone()),
            LocalFailure::Protocol(reason) => MuxrpcError::Protocol(reason.clone()),
        })
    }

    pub fn messages_sent(&self) -> usize {
        self.sent
    }

    pub fn messages_received(&self) -> usize {
        self.received
    }

    /// Cancelling the token from any task cancels the call. The next
    /// operation on it observes `CANCELLED`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn mark_active(&mut self) {
        if self.state == CallState::Created {
            self.state = CallState::Active;
        }
    }

    fn ended_error(&self) -> MuxrpcError {
        match (&self.state, &self.final_status) {
            (CallState::Cancelled, Some(status)) if status.code == StatusCode::DeadlineExceeded => {
                MuxrpcError::DeadlineExceeded(status.message.clone())
            }
            (CallState::Cancelled, _) => MuxrpcError::Cancelled,
            (state, _) => MuxrpcError::InvalidCallState(format!("call {} is {:?}", self.id, state)),
        }
    }

    /// Moves to a terminal state and gives back the stream and the lease.
    fn settle(&mut self, state: CallState, status: Status) {
        if self.state.is_terminal() {
            return;
        }
        tracing::debug!(
            call_id = self.id,
            method = %self.method.name,
            endpoint = %self.endpoint,
            state = ?state,
            code = %status.code,
            "call finished"
        );
        self.state = state;
        self.final_status = Some(status);
        if let Some(mut stream) = self.stream.take() {
            stream.cancel();
        }
        self.lease = None;
        self.registration = None;
    }

    /// Settles the call for `err` and hands the error back.
    fn terminate(&mut self, err: MuxrpcError) -> MuxrpcError {
        let (state, status) = match &err {
            MuxrpcError::Cancelled => (CallState::Cancelled, Status::cancelled("call cancelled")),
            MuxrpcError::DeadlineExceeded(reason) => {
                (CallState::Cancelled, Status::deadline_exceeded(reason.clone()))
            }
            other => (CallState::Failed, other.status()),
        };
        if !self.state.is_terminal() {
            self.transport_failure = err.is_transport_failure();
            self.local_failure = match &err {
                MuxrpcError::Transport(reason) => Some(LocalFailure::Transport(reason.clone())),
                MuxrpcError::Io(io) => Some(LocalFailure::Transport(io.to_string())),
                MuxrpcError::Protocol(reason) => Some(LocalFailure::Protocol(reason.clone())),
                _ => None,
            };
        }
        self.settle(state, status);
        err
    }

    fn cancel_local(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.cancel.cancel();
        self.settle(CallState::Cancelled, Status::cancelled("call cancelled by caller"));
    }

    async fn open(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        if self.state.is_terminal() {
            return Err(self.ended_error());
        }
        let Some(conn) = self.lease.as_ref().map(|lease| lease.connection().clone()) else {
            return Err(MuxrpcError::InvalidCallState(format!(
                "call {} has no connection",
                self.id
            )));
        };

        let mut header = OpenHeader::new(self.method.name.clone(), self.method.kind)
            .with_metadata(self.metadata.clone());
        if let Some(deadline) = self.deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let err = MuxrpcError::DeadlineExceeded("deadline passed before the call opened".to_string());
                return Err(self.terminate(err));
            }
            header = header.with_timeout_ms((remaining.as_millis() as u64).max(1));
        }

        match guarded(&self.cancel, self.deadline, conn.open(header)).await {
            Ok(stream) => {
                tracing::trace!(call_id = self.id, stream_id = stream.call_id(), conn_id = conn.id(), "call opened");
                self.stream = Some(stream);
                Ok(())
            }
            Err(err) => Err(self.terminate(err)),
        }
    }

    /// Next message, skipping end-of-stream markers. `Ok(None)` once the
    /// server finished with `OK`.
    async fn pump(&mut self) -> Result<Option<Bytes>> {
        loop {
            let Some(stream) = self.stream.as_mut() else {
                return Err(self.ended_error());
            };
            let item = guarded(&self.cancel, self.deadline, async move { Ok(stream.recv().await) }).await;

            match item {
                Err(err) => return Err(self.terminate(err)),
                Ok(Some(Inbound::Message(message))) => {
                    self.received += 1;
                    self.mark_active();
                    return Ok(Some(message));
                }
                Ok(Some(Inbound::EndOfStream)) => continue,
                Ok(Some(Inbound::Status(status))) => {
                    if status.is_ok() {
                        self.settle(CallState::Completed, status);
                        return Ok(None);
                    }
                    self.transport_failure = status.code == StatusCode::Unavailable;
                    self.settle(CallState::Failed, status.clone());
                    return Err(MuxrpcError::Remote(status));
                }
                Ok(Some(Inbound::Failed(err))) => return Err(self.terminate(err)),
                Ok(Some(Inbound::Cancelled)) | Ok(None) => {
                    let err = MuxrpcError::Transport("call stream closed unexpectedly".to_string());
                    return Err(self.terminate(err));
                }
            }
        }
    }

    /// Fails the call if a single-response kind received a second message.
    fn check_single_response(&mut self) -> Result<()> {
        if self.method.kind.server_streams() || self.received <= 1 {
            return Ok(());
        }
        let err = MuxrpcError::Protocol(format!(
            "{:?} call {} received more than one response",
            self.method.kind, self.id
        ));
        Err(self.terminate(err))
    }

    /// The server finished the call while we were still sending. Its
    /// status is queued; surface that instead of the send failure.
    async fn drain_status(&mut self) -> MuxrpcError {
        loop {
            match self.pump().await {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    return MuxrpcError::InvalidCallState(format!(
                        "call {} completed before the request was sent",
                        self.id
                    ))
                }
                Err(err) => return err,
            }
        }
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        if !self.state.is_terminal() && self.stream.is_some() {
            tracing::debug!(call_id = self.id, method = %self.method.name, "call dropped before finishing");
        }
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id)
            .field("method", &self.method.name)
            .field("kind", &self.method.kind)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .finish()
    }
}

/// Runs `fut` unless the call is cancelled or its deadline passes first.
async fn guarded<T, F>(cancel: &CancellationToken, deadline: Option<Instant>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(MuxrpcError::Cancelled),
        _ = sleep_until(deadline) => Err(MuxrpcError::DeadlineExceeded("call deadline exceeded".to_string())),
        result = fut => result,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Drives calls over leased connections.
///
/// Each [`Call`] moves `Created -> Active -> Completed | Cancelled | Failed`.
/// Unary and server-streaming calls take exactly one request and
/// half-close after it. Unary and client-streaming calls yield exactly one
/// response. Every terminal transition releases the call's lease.
#[derive(Debug, Default)]
pub struct Dispatcher {
    next_id: AtomicU64,
    active: ActiveCalls,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a call on `lease`. Nothing is written until the first send or
    /// receive.
    pub fn start(
        &self,
        lease: ConnectionLease,
        method: MethodDescriptor,
        deadline: Option<Instant>,
        metadata: Metadata,
    ) -> Call {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        lock(&self.active).insert(id, cancel.clone());
        let endpoint = lease.connection().endpoint().to_string();
        tracing::trace!(call_id = id, method = %method.name, kind = ?method.kind, %endpoint, "call created");

        Call {
            id,
            method,
            endpoint,
            deadline,
            metadata,
            cancel,
            state: CallState::Created,
            stream: None,
            lease: Some(lease),
            registration: Some(Registration {
                calls: self.active.clone(),
                id,
            }),
            sent: 0,
            received: 0,
            send_closed: false,
            final_status: None,
            transport_failure: false,
            local_failure: None,
        }
    }

    /// Sends one request message.
    ///
    /// Unary and server-streaming calls half-close right after their single
    /// request. A second send on them is [`MuxrpcError::InvalidCallState`].
    pub async fn send(&self, call: &mut Call, message: Bytes) -> Result<()> {
        if call.state.is_terminal() {
            return Err(call.ended_error());
        }
        if call.send_closed {
            return Err(MuxrpcError::InvalidCallState(format!(
                "call {} already closed its send side",
                call.id
            )));
        }
        if !call.method.kind.client_streams() && call.sent > 0 {
            return Err(MuxrpcError::InvalidCallState(format!(
                "{:?} call {} takes a single request",
                call.method.kind, call.id
            )));
        }

        call.open().await?;
        let Some(stream) = call.stream.as_mut() else {
            return Err(call.ended_error());
        };
        match guarded(&call.cancel, call.deadline, stream.send(message)).await {
            Ok(()) => {
                call.sent += 1;
                call.mark_active();
            }
            Err(MuxrpcError::InvalidArgument(reason)) => return Err(MuxrpcError::InvalidArgument(reason)),
            Err(MuxrpcError::InvalidCallState(_)) => return Err(call.drain_status().await),
            Err(err) => return Err(call.terminate(err)),
        }

        if !call.method.kind.client_streams() {
            self.close_send(call).await?;
        }
        Ok(())
    }

    /// Half-closes the request side. Idempotent.
    pub async fn close_send(&self, call: &mut Call) -> Result<()> {
        if call.send_closed {
            return Ok(());
        }
        if call.state.is_terminal() {
            return Err(call.ended_error());
        }

        call.open().await?;
        let Some(stream) = call.stream.as_mut() else {
            return Err(call.ended_error());
        };
        match guarded(&call.cancel, call.deadline, stream.half_close()).await {
            Ok(()) => {
                call.send_closed = true;
                Ok(())
            }
            Err(err) => Err(call.terminate(err)),
        }
    }

    /// Next response message. `Ok(None)` means the server finished with `OK`.
    ///
    /// A non-`OK` status from the server is returned as
    /// [`MuxrpcError::Remote`].
    pub async fn receive(&self, call: &mut Call) -> Result<Option<Bytes>> {
        match call.state {
            CallState::Completed => return Ok(None),
            CallState::Cancelled | CallState::Failed => return Err(call.ended_error()),
            CallState::Created | CallState::Active => {}
        }
        call.open().await?;
        let message = call.pump().await?;
        if message.is_some() {
            call.check_single_response()?;
        }
        Ok(message)
    }

    /// Cancels the call. The server is told with CANCEL and the lease is
    /// released. No-op on a finished call.
    pub fn cancel(&self, call: &mut Call) {
        call.cancel_local();
    }

    /// Waits for the final status and returns it. Repeated calls return
    /// the same status.
    ///
    /// Half-closes the request side if still open. Response messages not
    /// yet read are discarded, except that a second response on a
    /// single-response call fails it with a protocol error.
    pub async fn finish(&self, call: &mut Call) -> Status {
        if let Some(status) = &call.final_status {
            return status.clone();
        }

        if call.cancel.is_cancelled() {
            call.cancel_local();
        } else if self.close_send(call).await.is_ok() {
            while let Ok(Some(_)) = call.pump().await {
                if call.check_single_response().is_err() {
                    break;
                }
            }
        }

        call.final_status.clone().unwrap_or_else(|| {
            Status::internal(format!("call {} ended without a status", call.id))
        })
    }

    /// Calls started and not yet finished.
    pub fn active_calls(&self) -> usize {
        lock(&self.active).len()
    }

    /// Cancels every active call. Each observes `CANCELLED` on its next
    /// operation.
    pub fn cancel_all(&self) {
        let tokens: Vec<CancellationToken> = lock(&self.active).values().cloned().collect();
        if !tokens.is_empty() {
            tracing::debug!(calls = tokens.len(), "cancelling all active calls");
        }
        for token in tokens {
            token.cancel();
        }
    }
}
