use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use muxrpc_common::{
    CallKind, Inbound, MuxConfig, MuxStream, Multiplexer, MuxrpcError, Result, Status,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::handler::{Handler, HandlerResult, ServerStream, StreamingFn, UnaryFn, UnaryRequest};

/// Built-in liveness method. Answers with an empty payload.
pub const PING_METHOD: &str = "_ping";

/// Builds a [`Server`] from method handlers.
///
/// # Example
///
/// ```no_run
/// use muxrpc_server::Server;
/// use tokio::net::TcpListener;
///
/// # async fn demo() -> muxrpc_common::Result<()> {
/// let server = Server::builder()
///     .unary("echo", |req| async move { Ok(req.payload) })
///     .build();
///
/// let listener = TcpListener::bind("127.0.0.1:7000").await?;
/// server.serve(listener).await?;
/// # Ok(())
/// # }
/// ```
pub struct ServerBuilder {
    handlers: HashMap<String, Handler>,
    mux_config: MuxConfig,
}

impl ServerBuilder {
    fn new() -> Self {
        let mut handlers = HashMap::new();
        let ping: Arc<UnaryFn> = Arc::new(|_req| async { Ok(Bytes::new()) }.boxed());
        handlers.insert(PING_METHOD.to_string(), Handler::Unary(ping));
        Self {
            handlers,
            mux_config: MuxConfig::default(),
        }
    }

    /// Registers a unary handler. Replaces any handler already under `method`.
    pub fn unary<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(UnaryRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<Bytes>> + Send + 'static,
    {
        let handler: Arc<UnaryFn> = Arc::new(move |req| handler(req).boxed());
        self.handlers.insert(method.into(), Handler::Unary(handler));
        self
    }

    /// Registers a streaming handler for calls of `kind`.
    pub fn streaming<F, Fut>(mut self, method: impl Into<String>, kind: CallKind, handler: F) -> Self
    where
        F: Fn(ServerStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<()>> + Send + 'static,
    {
        let handler: Arc<StreamingFn> = Arc::new(move |stream| handler(stream).boxed());
        self.handlers
            .insert(method.into(), Handler::Streaming { kind, handler });
        self
    }

    pub fn mux_config(mut self, config: MuxConfig) -> Self {
        self.mux_config = config;
        self
    }

    pub fn build(self) -> Server {
        Server {
            handlers: Arc::new(self.handlers),
            mux_config: self.mux_config,
            shutdown: CancellationToken::new(),
        }
    }
}

/// Serves registered handlers over multiplexed connections.
///
/// Cloning is cheap; clones share handlers and the shutdown signal.
#[derive(Clone)]
pub struct Server {
    handlers: Arc<HashMap<String, Handler>>,
    mux_config: MuxConfig,
    shutdown: CancellationToken,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }

    /// Accepts connections until [`shutdown`](Self::shutdown) is called.
    ///
    /// Each connection is served on its own task.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::debug!(%local_addr, methods = self.handlers.len(), "serving");

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer_addr)) => {
                    if let Err(err) = socket.set_nodelay(true) {
                        tracing::debug!(%peer_addr, error = %err, "failed to set TCP_NODELAY");
                    }
                    tracing::debug!(%peer_addr, "connection accepted");
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.serve_connection(socket).await;
                        tracing::debug!(%peer_addr, "connection finished");
                    });
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }

        Ok(())
    }

    /// Serves every call opened on one connection until it closes.
    pub async fn serve_connection<T>(&self, io: T)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mux, mut accept) = Multiplexer::server(io, self.mux_config.clone());

        loop {
            let stream = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                stream = accept.recv() => match stream {
                    Some(stream) => stream,
                    None => break,
                },
            };
            let handlers = self.handlers.clone();
            tokio::spawn(handle_call(handlers, stream));
        }

        mux.close();
    }

    /// Stops accepting connections and closes the ones being served.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Runs one call to completion and writes its final status.
async fn handle_call(handlers: Arc<HashMap<String, Handler>>, mut stream: MuxStream) {
    let Some(header) = stream.header().cloned() else {
        return;
    };
    let call_id = stream.call_id();
    let deadline = header
        .timeout_ms
        .map(|ms| Instant::now() + Duration::from_millis(ms));

    let handler = match handlers.get(&header.method) {
        Some(handler) if handler.kind() == header.kind => handler.clone(),
        Some(handler) => {
            let status = Status::invalid_argument(format!(
                "method '{}' is {:?}, call was opened as {:?}",
                header.method,
                handler.kind(),
                header.kind
            ));
            finish(&mut stream, status).await;
            return;
        }
        None => {
            tracing::debug!(call_id, method = %header.method, "unknown method");
            let status = Status::invalid_argument(format!("unknown method '{}'", header.method));
            finish(&mut stream, status).await;
            return;
        }
    };

    tracing::trace!(call_id, method = %header.method, kind = ?header.kind, "dispatching call");

    match handler {
        Handler::Unary(handler) => {
            let payload = match read_unary_request(&mut stream).await {
                Ok(payload) => payload,
                Err(None) => return,
                Err(Some(status)) => {
                    finish(&mut stream, status).await;
                    return;
                }
            };

            let request = UnaryRequest {
                method: header.method.clone(),
                metadata: header.metadata,
                payload,
                deadline,
            };

            // Only CANCEL or a connection failure can arrive after the request.
            let outcome = tokio::select! {
                outcome = with_deadline(deadline, handler(request)) => outcome,
                _ = stream.recv() => {
                    tracing::debug!(call_id, method = %header.method, "call cancelled, handler abandoned");
                    return;
                }
            };

            let status = match outcome {
                Ok(response) => match stream.send(response).await {
                    Ok(()) => Status::ok(),
                    Err(err) => {
                        tracing::debug!(call_id, error = %err, "failed to send response");
                        return;
                    }
                },
                Err(status) => status,
            };
            finish(&mut stream, status).await;
        }
        Handler::Streaming { kind, handler } => {
            let responder = stream.responder();
            let server_stream = ServerStream::new(stream, header.method.clone(), kind, header.metadata, deadline);
            // The handler owns the stream, so CANCEL is observed through the responder.
            let outcome = tokio::select! {
                outcome = with_deadline(deadline, handler(server_stream)) => outcome,
                _ = responder.abandoned() => {
                    tracing::debug!(call_id, method = %header.method, "call cancelled, handler abandoned");
                    return;
                }
            };
            let status = match outcome {
                Ok(()) => Status::ok(),
                Err(status) => status,
            };
            if let Err(err) = responder.send_status(status).await {
                tracing::debug!(call_id, error = %err, "failed to send status");
            }
        }
    }
}

/// Reads the single request of a unary call.
///
/// `Err(None)` means the call is already gone (cancelled or connection lost).
async fn read_unary_request(stream: &mut MuxStream) -> std::result::Result<Bytes, Option<Status>> {
    let payload = match stream.recv().await {
        Some(Inbound::Message(payload)) => payload,
        Some(Inbound::EndOfStream) => {
            return Err(Some(Status::invalid_argument("unary call carried no request")))
        }
        _ => return Err(None),
    };

    match stream.recv().await {
        Some(Inbound::EndOfStream) => Ok(payload),
        Some(Inbound::Message(_)) => Err(Some(Status::invalid_argument(
            "unary call carried more than one request",
        ))),
        _ => Err(None),
    }
}

async fn with_deadline<T, F>(deadline: Option<Instant>, fut: F) -> HandlerResult<T>
where
    F: Future<Output = HandlerResult<T>>,
{
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .unwrap_or_else(|_| Err(Status::deadline_exceeded("server deadline exceeded"))),
        None => fut.await,
    }
}

async fn finish(stream: &mut MuxStream, status: Status) {
    let call_id = stream.call_id();
    if let Err(err) = stream.send_status(status).await {
        match err {
            MuxrpcError::Transport(_) | MuxrpcError::Protocol(_) => {
                tracing::debug!(call_id, error = %err, "connection gone before status was sent")
            }
            other => tracing::warn!(call_id, error = %other, "failed to send status"),
        }
    }
}
