use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use muxrpc_common::{CallKind, Inbound, Metadata, MuxStream, Status};
use tokio::time::Instant;

/// Result type returned by method handlers.
pub type HandlerResult<T> = std::result::Result<T, Status>;

pub type UnaryFn = dyn Fn(UnaryRequest) -> BoxFuture<'static, HandlerResult<Bytes>> + Send + Sync;
pub type StreamingFn = dyn Fn(ServerStream) -> BoxFuture<'static, HandlerResult<()>> + Send + Sync;

/// A registered method implementation.
#[derive(Clone)]
pub(crate) enum Handler {
    Unary(Arc<UnaryFn>),
    Streaming { kind: CallKind, handler: Arc<StreamingFn> },
}

impl Handler {
    pub(crate) fn kind(&self) -> CallKind {
        match self {
            Handler::Unary(_) => CallKind::Unary,
            Handler::Streaming { kind, .. } => *kind,
        }
    }
}

/// Input to a unary handler.
#[derive(Debug, Clone)]
pub struct UnaryRequest {
    pub method: String,
    pub metadata: Metadata,
    pub payload: Bytes,
    /// Absolute deadline derived from the caller's timeout, if one was sent.
    pub deadline: Option<Instant>,
}

/// Server side of a streaming call, handed to streaming handlers.
///
/// Client cancellation surfaces as a `CANCELLED` error from [`next`](Self::next)
/// or [`send`](Self::send).
pub struct ServerStream {
    inner: MuxStream,
    method: String,
    kind: CallKind,
    metadata: Metadata,
    deadline: Option<Instant>,
    end_of_stream: bool,
    sent: usize,
}

impl ServerStream {
    pub(crate) fn new(
        inner: MuxStream,
        method: String,
        kind: CallKind,
        metadata: Metadata,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            inner,
            method,
            kind,
            metadata,
            deadline,
            end_of_stream: false,
            sent: 0,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Next message from the client, or `None` once the client half-closed.
    pub async fn next(&mut self) -> HandlerResult<Option<Bytes>> {
        if self.end_of_stream {
            return Ok(None);
        }
        match self.inner.recv().await {
            Some(Inbound::Message(message)) => Ok(Some(message)),
            Some(Inbound::EndOfStream) => {
                self.end_of_stream = true;
                Ok(None)
            }
            Some(Inbound::Failed(err)) => Err(err.status()),
            Some(Inbound::Status(_)) => Err(Status::internal("unexpected STATUS on server stream")),
            Some(Inbound::Cancelled) | None => Err(Status::cancelled("call cancelled by client")),
        }
    }

    /// Sends one message to the client.
    pub async fn send(&mut self, message: Bytes) -> HandlerResult<()> {
        if !self.kind.server_streams() && self.sent > 0 {
            return Err(Status::internal(format!(
                "{:?} call allows a single response",
                self.kind
            )));
        }
        self.inner.send(message).await.map_err(|e| e.status())?;
        self.sent += 1;
        Ok(())
    }
}

impl std::fmt::Debug for ServerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerStream")
            .field("call_id", &self.inner.call_id())
            .field("method", &self.method)
            .field("kind", &self.kind)
            .finish()
    }
}
