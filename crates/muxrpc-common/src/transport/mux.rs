//! Stream multiplexer.
//!
//! A [`Multiplexer`] owns one byte stream (normally a TCP connection) and
//! carries many concurrent calls over it. Each call gets a [`MuxStream`]
//! with its own bounded receive queue, so a slow consumer on one call
//! never blocks delivery to the others.
//!
//! # Architecture
//!
//! - **Writer task**: the only task that writes to the socket. Frames from
//!   every call are queued on one channel and written in arrival order,
//!   which keeps frames of the same call ordered.
//! - **Reader task**: decodes frames and routes them by call id into the
//!   per-call queues. Unknown call ids (late frames for finished calls) are
//!   dropped.
//! - **Credit**: every call starts with `recv_window` credits in each
//!   direction. A DATA frame consumes one credit; the receiver returns
//!   credit with WINDOW_UPDATE once the application has consumed half the
//!   window. Both peers must agree on `recv_window`.
//!
//! Any protocol violation (unknown frame type, malformed header, DATA
//! beyond the granted credit, a frame the role may not receive) fails the
//! whole connection: every active call observes a
//! [`MuxrpcError::Protocol`] and the multiplexer reports itself closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::protocol::error::{MuxrpcError, Result};
use crate::protocol::frames::{CallId, Frame, OpenHeader};
use crate::protocol::status::Status;
use crate::transport::codec::{FrameCodec, DEFAULT_MAX_FRAME_SIZE};

/// Frames queued for the writer before senders start waiting.
const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Queue slots reserved per call for non-DATA items (end of stream,
/// status or cancel, connection failure).
const CONTROL_SLOTS: usize = 4;

/// Multiplexer settings.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// DATA frames a peer may send on one call before waiting for credit.
    pub recv_window: u32,
    /// Largest frame accepted or produced, in bytes.
    pub max_frame_size: usize,
    /// Opened calls a server buffers before answering `UNAVAILABLE`.
    pub accept_backlog: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            recv_window: 32,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            accept_backlog: 128,
        }
    }
}

/// Which end of the connection this multiplexer drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// An item delivered to one call's receive queue.
#[derive(Debug)]
pub enum Inbound {
    /// One message from the peer.
    Message(Bytes),
    /// The peer half-closed: no more messages will follow.
    EndOfStream,
    /// Final status from the server. Terminal.
    Status(Status),
    /// The client cancelled the call. Terminal.
    Cancelled,
    /// The connection failed underneath the call. Terminal.
    Failed(MuxrpcError),
}

#[derive(Debug, Clone)]
struct Failure {
    protocol: bool,
    reason: String,
}

impl Failure {
    fn to_error(&self) -> MuxrpcError {
        if self.protocol {
            MuxrpcError::Protocol(self.reason.clone())
        } else {
            MuxrpcError::Transport(self.reason.clone())
        }
    }
}

struct Route {
    tx: mpsc::Sender<Inbound>,
    send_credit: Arc<Semaphore>,
    /// Fired when the peer cancels the call or the connection fails.
    abandoned: CancellationToken,
    recv_credit: u32,
    peer_half_closed: bool,
}

struct Shared {
    role: Role,
    config: MuxConfig,
    outbound: mpsc::Sender<Frame>,
    routes: Mutex<HashMap<CallId, Route>>,
    next_call_id: AtomicU64,
    closed: CancellationToken,
    failure: Mutex<Option<Failure>>,
}

impl Shared {
    fn routes(&self) -> MutexGuard<'_, HashMap<CallId, Route>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn failure(&self) -> Option<Failure> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn closed_error(&self) -> MuxrpcError {
        self.failure()
            .map(|f| f.to_error())
            .unwrap_or_else(|| MuxrpcError::Transport("connection closed".to_string()))
    }

    fn register(self: &Arc<Self>, call_id: CallId, header: Option<OpenHeader>) -> Result<MuxStream> {
        let window = self.config.recv_window;
        let (tx, rx) = mpsc::channel(window as usize + CONTROL_SLOTS);
        let send_credit = Arc::new(Semaphore::new(window as usize));
        let abandoned = CancellationToken::new();

        let mut routes = self.routes();
        if self.closed.is_cancelled() {
            return Err(self.closed_error());
        }
        if routes.contains_key(&call_id) {
            return Err(MuxrpcError::Protocol(format!("call id {call_id} opened twice")));
        }
        routes.insert(
            call_id,
            Route {
                tx,
                send_credit: send_credit.clone(),
                abandoned: abandoned.clone(),
                recv_credit: window,
                peer_half_closed: false,
            },
        );
        drop(routes);

        Ok(MuxStream {
            call_id,
            shared: self.clone(),
            inbound: rx,
            send_credit,
            abandoned,
            header,
            consumed: 0,
            send_closed: false,
            finished: false,
        })
    }

    fn remove_route(&self, call_id: CallId) -> Option<Route> {
        let route = self.routes().remove(&call_id);
        if let Some(route) = &route {
            route.send_credit.close();
        }
        route
    }

    /// True for a client's DATA or HALF_CLOSE whose call is already gone.
    /// Cancelled calls leave no frames behind on the wire.
    fn is_stale(&self, frame: &Frame) -> bool {
        self.role == Role::Client
            && matches!(frame, Frame::Data { .. } | Frame::HalfClose { .. })
            && !self.routes().contains_key(&frame.call_id())
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(self.closed_error());
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| self.closed_error())
    }

    /// Queues a frame without waiting. Used from `Drop` and the reader task.
    fn send_control(&self, frame: Frame) {
        match self.outbound.try_send(frame) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(frame)) => {
                let outbound = self.outbound.clone();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = outbound.send(frame).await;
                    });
                }
            }
        }
    }

    /// Returns receive credit for `call_id` and tells the peer.
    fn grant(&self, call_id: CallId, credit: u32) {
        let routed = match self.routes().get_mut(&call_id) {
            Some(route) => {
                route.recv_credit += credit;
                true
            }
            None => false,
        };
        if routed {
            self.send_control(Frame::WindowUpdate { call_id, credit });
        }
    }

    /// Fails the connection and every call still routed on it.
    fn fail(&self, err: MuxrpcError) {
        let failure = match err {
            MuxrpcError::Protocol(reason) => Failure {
                protocol: true,
                reason,
            },
            MuxrpcError::Transport(reason) => Failure {
                protocol: false,
                reason,
            },
            other => Failure {
                protocol: false,
                reason: other.to_string(),
            },
        };

        let first = {
            let mut slot = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(failure.clone());
                true
            } else {
                false
            }
        };

        let routes = {
            let mut routes = self.routes();
            self.closed.cancel();
            std::mem::take(&mut *routes)
        };

        if first {
            if failure.protocol || !routes.is_empty() {
                tracing::warn!(
                    role = ?self.role,
                    active_calls = routes.len(),
                    error = %failure.reason,
                    "connection failed"
                );
            } else {
                tracing::debug!(role = ?self.role, reason = %failure.reason, "connection closed");
            }
        }

        for (_, route) in routes {
            route.send_credit.close();
            route.abandoned.cancel();
            let _ = route.tx.try_send(Inbound::Failed(failure.to_error()));
        }
    }

    /// Routes one decoded frame. An error here is a protocol violation.
    fn dispatch(self: &Arc<Self>, frame: Frame, accept: Option<&mpsc::Sender<MuxStream>>) -> Result<()> {
        match frame {
            Frame::Open { call_id, header } => {
                let Some(accept) = accept else {
                    return Err(MuxrpcError::Protocol(format!(
                        "peer opened call {call_id} on a client connection"
                    )));
                };
                let method = header.method.clone();
                let stream = self.register(call_id, Some(header))?;
                tracing::debug!(call_id, method = %method, "call opened by peer");
                if let Err(err) = accept.try_send(stream) {
                    let reason = match err {
                        TrySendError::Full(_) => "server is overloaded",
                        TrySendError::Closed(_) => "server is not accepting calls",
                    };
                    tracing::warn!(call_id, method = %method, reason, "rejecting call");
                    self.send_control(Frame::Status {
                        call_id,
                        status: Status::unavailable(reason),
                    });
                }
                Ok(())
            }
            Frame::Data { call_id, payload } => {
                let mut routes = self.routes();
                let Some(route) = routes.get_mut(&call_id) else {
                    tracing::trace!(call_id, "dropping DATA for unknown call");
                    return Ok(());
                };
                if route.peer_half_closed {
                    return Err(MuxrpcError::Protocol(format!(
                        "DATA after HALF_CLOSE on call {call_id}"
                    )));
                }
                if route.recv_credit == 0 {
                    return Err(MuxrpcError::Protocol(format!(
                        "call {call_id} sent DATA beyond its receive window"
                    )));
                }
                route.recv_credit -= 1;
                match route.tx.try_send(Inbound::Message(payload)) {
                    Ok(()) => Ok(()),
                    Err(TrySendError::Closed(_)) => {
                        routes.remove(&call_id);
                        Ok(())
                    }
                    Err(TrySendError::Full(_)) => Err(MuxrpcError::Protocol(format!(
                        "receive queue overflow on call {call_id}"
                    ))),
                }
            }
            Frame::HalfClose { call_id } => {
                let mut routes = self.routes();
                let Some(route) = routes.get_mut(&call_id) else {
                    return Ok(());
                };
                if route.peer_half_closed {
                    return Err(MuxrpcError::Protocol(format!(
                        "duplicate HALF_CLOSE on call {call_id}"
                    )));
                }
                route.peer_half_closed = true;
                let _ = route.tx.try_send(Inbound::EndOfStream);
                Ok(())
            }
            Frame::Status { call_id, status } => {
                if self.role == Role::Server {
                    return Err(MuxrpcError::Protocol(format!(
                        "server received STATUS for call {call_id}"
                    )));
                }
                if let Some(route) = self.remove_route(call_id) {
                    let _ = route.tx.try_send(Inbound::Status(status));
                }
                Ok(())
            }
            Frame::Cancel { call_id } => {
                if self.role == Role::Client {
                    return Err(MuxrpcError::Protocol(format!(
                        "client received CANCEL for call {call_id}"
                    )));
                }
                if let Some(route) = self.remove_route(call_id) {
                    tracing::debug!(call_id, "call cancelled by peer");
                    route.abandoned.cancel();
                    let _ = route.tx.try_send(Inbound::Cancelled);
                }
                Ok(())
            }
            Frame::WindowUpdate { call_id, credit } => {
                let routes = self.routes();
                let Some(route) = routes.get(&call_id) else {
                    return Ok(());
                };
                let available = route.send_credit.available_permits() as u64;
                if available + credit as u64 > self.config.recv_window as u64 {
                    return Err(MuxrpcError::Protocol(format!(
                        "call {call_id} granted {credit} credits beyond the window"
                    )));
                }
                route.send_credit.add_permits(credit as usize);
                Ok(())
            }
        }
    }
}

async fn read_loop<R>(
    shared: Arc<Shared>,
    mut frames: FramedRead<R, FrameCodec>,
    accept: Option<mpsc::Sender<MuxStream>>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = shared.closed.cancelled() => return,
            next = frames.next() => next,
        };

        let result = match next {
            Some(Ok(frame)) => shared.dispatch(frame, accept.as_ref()),
            Some(Err(err)) => Err(err),
            None => Err(MuxrpcError::Transport("connection closed by peer".to_string())),
        };

        if let Err(err) = result {
            shared.fail(err);
            return;
        }
    }
}

async fn write_loop<W>(
    shared: Arc<Shared>,
    mut sink: FramedWrite<W, FrameCodec>,
    mut outbound: mpsc::Receiver<Frame>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = shared.closed.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        if let Err(err) = write_batch(&shared, &mut sink, &mut outbound, frame).await {
            shared.fail(err);
            break;
        }
    }
}

/// Writes `first` plus whatever else is already queued, then flushes once.
/// Frames of calls cancelled while queued are dropped here.
async fn write_batch<W>(
    shared: &Shared,
    sink: &mut FramedWrite<W, FrameCodec>,
    outbound: &mut mpsc::Receiver<Frame>,
    first: Frame,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = Some(first);
    while let Some(next) = frame {
        if shared.is_stale(&next) {
            tracing::trace!(call_id = next.call_id(), "discarding frame of finished call");
        } else {
            sink.feed(next).await?;
        }
        frame = outbound.try_recv().ok();
    }
    sink.flush().await
}

/// Carries many calls over one byte stream.
///
/// Dropping the multiplexer closes the connection and fails its calls.
pub struct Multiplexer {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl Multiplexer {
    /// Starts the client side of a connection. Must be called within a Tokio runtime.
    pub fn client<T>(io: T, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::start(io, Role::Client, config, None)
    }

    /// Starts the server side of a connection.
    ///
    /// Calls opened by the peer arrive on the returned receiver. It yields
    /// `None` once the connection is gone.
    pub fn server<T>(io: T, config: MuxConfig) -> (Self, mpsc::Receiver<MuxStream>)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));
        let mux = Self::start(io, Role::Server, config, Some(accept_tx));
        (mux, accept_rx)
    }

    fn start<T>(io: T, role: Role, config: MuxConfig, accept: Option<mpsc::Sender<MuxStream>>) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let codec = FrameCodec::with_max_frame_size(config.max_frame_size);

        let shared = Arc::new(Shared {
            role,
            config,
            outbound: outbound_tx,
            routes: Mutex::new(HashMap::new()),
            next_call_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
            failure: Mutex::new(None),
        });

        let reader = FramedRead::new(read_half, codec.clone());
        let writer = FramedWrite::new(write_half, codec);
        let tasks = vec![
            tokio::spawn(read_loop(shared.clone(), reader, accept)),
            tokio::spawn(write_loop(shared.clone(), writer, outbound_rx)),
        ];

        Self { shared, tasks }
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn config(&self) -> &MuxConfig {
        &self.shared.config
    }

    /// Opens a new call. Client side only.
    ///
    /// Allocates the next call id, registers its receive queue and writes
    /// the OPEN frame.
    ///
    /// # Errors
    ///
    /// Returns the connection's failure if it is already closed, or
    /// [`MuxrpcError::InvalidCallState`] on a server-side multiplexer.
    pub async fn open(&self, header: OpenHeader) -> Result<MuxStream> {
        if self.shared.role != Role::Client {
            return Err(MuxrpcError::InvalidCallState(
                "only the client side of a connection opens calls".to_string(),
            ));
        }

        let call_id = self.shared.next_call_id.fetch_add(1, Ordering::Relaxed);
        let stream = self.shared.register(call_id, None)?;
        tracing::trace!(call_id, method = %header.method, "opening call");
        self.shared.send_frame(Frame::Open { call_id, header }).await?;
        Ok(stream)
    }

    /// True once the connection failed or was shut down.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// The error that closed the connection, if any.
    pub fn failure(&self) -> Option<MuxrpcError> {
        self.shared.failure().map(|f| f.to_error())
    }

    /// Calls currently routed on this connection.
    pub fn active_streams(&self) -> usize {
        self.shared.routes().len()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    /// Shuts the connection down, failing any calls still on it.
    pub fn close(&self) {
        if !self.is_closed() {
            self.shared
                .fail(MuxrpcError::Transport("connection shut down".to_string()));
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.close();
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("role", &self.shared.role)
            .field("closed", &self.is_closed())
            .field("active_streams", &self.active_streams())
            .finish()
    }
}

/// One call's view of a multiplexed connection.
///
/// Dropping an unfinished client-side stream cancels the call.
pub struct MuxStream {
    call_id: CallId,
    shared: Arc<Shared>,
    inbound: mpsc::Receiver<Inbound>,
    send_credit: Arc<Semaphore>,
    abandoned: CancellationToken,
    header: Option<OpenHeader>,
    consumed: u32,
    send_closed: bool,
    finished: bool,
}

impl MuxStream {
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// The OPEN header. Present on server-side streams only.
    pub fn header(&self) -> Option<&OpenHeader> {
        self.header.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn ended_error(&self) -> MuxrpcError {
        if let Some(failure) = self.shared.failure() {
            return failure.to_error();
        }
        match self.shared.role {
            Role::Server => MuxrpcError::Cancelled,
            Role::Client => MuxrpcError::InvalidCallState(format!(
                "call {} already finished",
                self.call_id
            )),
        }
    }

    /// Sends one message, waiting for send credit if the peer's window is full.
    pub async fn send(&mut self, payload: Bytes) -> Result<()> {
        if self.finished {
            return Err(self.ended_error());
        }
        if self.send_closed {
            return Err(MuxrpcError::InvalidCallState(format!(
                "send after half-close on call {}",
                self.call_id
            )));
        }
        if payload.len() + 9 > self.shared.config.max_frame_size {
            return Err(MuxrpcError::InvalidArgument(format!(
                "message of {} bytes exceeds the frame limit",
                payload.len()
            )));
        }

        match self.send_credit.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(self.ended_error()),
        }

        self.shared
            .send_frame(Frame::Data {
                call_id: self.call_id,
                payload,
            })
            .await
    }

    /// Tells the peer no more messages will be sent. Idempotent.
    pub async fn half_close(&mut self) -> Result<()> {
        if self.send_closed || self.finished {
            return Ok(());
        }
        self.send_closed = true;
        self.shared
            .send_frame(Frame::HalfClose {
                call_id: self.call_id,
            })
            .await
    }

    /// Writes the final status and finishes the call. Server side only.
    pub async fn send_status(&mut self, status: Status) -> Result<()> {
        if self.shared.role != Role::Server {
            return Err(MuxrpcError::InvalidCallState(
                "only the server side sends a status".to_string(),
            ));
        }
        self.finished = true;
        self.shared.remove_route(self.call_id);
        self.shared
            .send_frame(Frame::Status {
                call_id: self.call_id,
                status,
            })
            .await
    }

    /// Next item for this call. `None` means the queue was torn down.
    ///
    /// Cancel safe: an item is never lost if this future is dropped.
    pub async fn recv(&mut self) -> Option<Inbound> {
        let item = self.inbound.recv().await;
        match &item {
            Some(Inbound::Message(_)) => {
                self.consumed += 1;
                let threshold = (self.shared.config.recv_window / 2).max(1);
                if self.consumed >= threshold && !self.finished {
                    let credit = std::mem::take(&mut self.consumed);
                    self.shared.grant(self.call_id, credit);
                }
            }
            Some(Inbound::Status(_)) | Some(Inbound::Cancelled) | Some(Inbound::Failed(_)) | None => {
                self.finished = true;
            }
            Some(Inbound::EndOfStream) => {}
        }
        item
    }

    /// A handle that can finish this call after the stream itself has been
    /// handed off or dropped. Server side only.
    pub fn responder(&self) -> Responder {
        Responder {
            shared: self.shared.clone(),
            call_id: self.call_id,
            abandoned: self.abandoned.clone(),
        }
    }

    /// Abandons the call. A client-side stream tells the peer with CANCEL.
    pub fn cancel(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let routed = self.shared.remove_route(self.call_id).is_some();
        if routed && self.shared.role == Role::Client {
            tracing::debug!(call_id = self.call_id, "cancelling call");
            self.shared.send_control(Frame::Cancel {
                call_id: self.call_id,
            });
        }
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel();
        }
    }
}

/// Writes the final status of a server-side call.
#[derive(Clone)]
pub struct Responder {
    shared: Arc<Shared>,
    call_id: CallId,
    abandoned: CancellationToken,
}

impl Responder {
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Resolves once the peer cancels the call or the connection fails.
    /// Never resolves for a call that finishes normally.
    pub async fn abandoned(&self) {
        self.abandoned.cancelled().await
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.is_cancelled()
    }

    pub async fn send_status(&self, status: Status) -> Result<()> {
        if self.shared.role != Role::Server {
            return Err(MuxrpcError::InvalidCallState(
                "only the server side sends a status".to_string(),
            ));
        }
        self.shared.remove_route(self.call_id);
        self.shared
            .send_frame(Frame::Status {
                call_id: self.call_id,
                status,
            })
            .await
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("call_id", &self.call_id)
            .field("finished", &self.finished)
            .finish()
    }
}
