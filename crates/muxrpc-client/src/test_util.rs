use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use muxrpc_common::{CallKind, MuxConfig, Multiplexer, MuxrpcError, Result, Status};
use muxrpc_server::Server;

use crate::connection::Connector;

/// Dials in-memory connections served by a muxrpc server.
pub(crate) struct TestConnector {
    server: Server,
    dials: AtomicUsize,
    pub(crate) refuse: AtomicBool,
}

impl TestConnector {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_server(test_server())
    }

    pub(crate) fn with_server(server: Server) -> Arc<Self> {
        Arc::new(Self {
            server,
            dials: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
        })
    }

    pub(crate) fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

impl Connector for TestConnector {
    fn connect<'a>(&'a self, _endpoint: &'a str) -> BoxFuture<'a, Result<Multiplexer>> {
        async move {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if self.refuse.load(Ordering::SeqCst) {
                return Err(MuxrpcError::Transport("connection refused".to_string()));
            }
            let (client, server_io) = tokio::io::duplex(64 * 1024);
            let server = self.server.clone();
            tokio::spawn(async move { server.serve_connection(server_io).await });
            Ok(Multiplexer::client(client, MuxConfig::default()))
        }
        .boxed()
    }
}

pub(crate) fn test_server() -> Server {
    Server::builder()
        .unary("echo", |req| async move { Ok(req.payload) })
        .unary("fail", |_req| async move { Err(Status::internal("handler exploded")) })
        .unary("sleep", |_req| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Bytes::new())
        })
        .streaming("chat", CallKind::BidiStream, |mut stream| async move {
            while let Some(message) = stream.next().await? {
                let mut reply = b"re:".to_vec();
                reply.extend_from_slice(&message);
                stream.send(Bytes::from(reply)).await?;
            }
            Ok(())
        })
        .build()
}
