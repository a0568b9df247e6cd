// Shared helpers for the muxrpc-client integration suites.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use muxrpc_client::Connector;
use muxrpc_common::transport::FrameCodec;
use muxrpc_common::{CallId, Frame, MuxConfig, Multiplexer, MuxrpcError, Result, Status};
use muxrpc_server::Server;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::{Encoder, FramedRead};

/// Serves `server` on an ephemeral port and counts accepted connections.
pub async fn start_counting_server(server: Server) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let server = server.clone();
            tokio::spawn(async move { server.serve_connection(socket).await });
        }
    });

    (addr, accepted)
}

/// An address nothing listens on.
pub async fn dead_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

/// Dials in-memory connections, so tests can run on paused time.
pub struct InMemoryConnector {
    server: Server,
    dials: AtomicUsize,
    refuse: AtomicBool,
}

impl InMemoryConnector {
    pub fn new(server: Server) -> Arc<Self> {
        Arc::new(Self {
            server,
            dials: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
        })
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

impl Connector for InMemoryConnector {
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

/// Counts how often a handler ran.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Dials a hand-written peer that speaks the frame protocol directly, so
/// tests can make the remote side misbehave.
///
/// Each call is answered when the client half-closes it, by method:
/// - `garbled`: one DATA, then a frame of unknown type 77
/// - `double`: two DATA frames, then STATUS OK
/// - anything else is held until [`ScriptedConnector::release`]
#[derive(Default)]
pub struct ScriptedConnector {
    peers: Mutex<Vec<PeerHandle>>,
}

struct PeerHandle {
    calls: Arc<AtomicUsize>,
    commands: mpsc::UnboundedSender<PeerCommand>,
}

enum PeerCommand {
    Garble,
    Release,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn dials(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// Calls the peer on dial number `dial` has received in full, i.e.
    /// opened and half-closed.
    pub fn calls(&self, dial: usize) -> usize {
        self.peers
            .lock()
            .unwrap()
            .get(dial)
            .map_or(0, |peer| peer.calls.load(Ordering::SeqCst))
    }

    pub fn total_calls(&self) -> usize {
        (0..self.dials()).map(|dial| self.calls(dial)).sum()
    }

    /// Writes a frame of unknown type on connection `dial`.
    pub fn garble(&self, dial: usize) {
        self.command(dial, PeerCommand::Garble);
    }

    /// Answers every held call on connection `dial` with DATA "released"
    /// and STATUS OK.
    pub fn release(&self, dial: usize) {
        self.command(dial, PeerCommand::Release);
    }

    fn command(&self, dial: usize, command: PeerCommand) {
        let _ = self.peers.lock().unwrap()[dial].commands.send(command);
    }
}

impl Connector for ScriptedConnector {
    fn connect<'a>(&'a self, _endpoint: &'a str) -> BoxFuture<'a, Result<Multiplexer>> {
        async move {
            let (client, peer_io) = tokio::io::duplex(64 * 1024);
            let calls = Arc::new(AtomicUsize::new(0));
            let (commands, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_scripted_peer(peer_io, calls.clone(), rx));
            self.peers.lock().unwrap().push(PeerHandle { calls, commands });
            Ok(Multiplexer::client(client, MuxConfig::default()))
        }
        .boxed()
    }
}

fn encode(out: &mut BytesMut, frame: Frame) {
    FrameCodec::new().encode(frame, out).unwrap();
}

fn encode_unknown_type(out: &mut BytesMut, call_id: CallId) {
    out.put_u32(9);
    out.put_u64(call_id);
    out.put_u8(77);
}

async fn run_scripted_peer(
    io: DuplexStream,
    calls: Arc<AtomicUsize>,
    mut commands: mpsc::UnboundedReceiver<PeerCommand>,
) {
    let (read_half, mut write_half) = tokio::io::split(io);
    let mut frames = FramedRead::new(read_half, FrameCodec::new());
    let mut methods: HashMap<CallId, String> = HashMap::new();
    let mut held: Vec<CallId> = Vec::new();

    loop {
        let mut out = BytesMut::new();
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(Frame::Open { call_id, header })) => {
                    methods.insert(call_id, header.method);
                }
                Some(Ok(Frame::HalfClose { call_id })) => {
                    calls.fetch_add(1, Ordering::SeqCst);
                    match methods.get(&call_id).map(String::as_str) {
                        Some("garbled") => {
                            encode(&mut out, Frame::Data { call_id, payload: Bytes::from_static(b"one") });
                            encode_unknown_type(&mut out, call_id);
                        }
                        Some("double") => {
                            encode(&mut out, Frame::Data { call_id, payload: Bytes::from_static(b"one") });
                            encode(&mut out, Frame::Data { call_id, payload: Bytes::from_static(b"two") });
                            encode(&mut out, Frame::Status { call_id, status: Status::ok() });
                        }
                        _ => held.push(call_id),
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => return,
            },
            command = commands.recv() => match command {
                Some(PeerCommand::Garble) => encode_unknown_type(&mut out, 0),
                Some(PeerCommand::Release) => {
                    for call_id in held.drain(..) {
                        encode(&mut out, Frame::Data { call_id, payload: Bytes::from_static(b"released") });
                        encode(&mut out, Frame::Status { call_id, status: Status::ok() });
                    }
                }
                None => return,
            },
        }
        if !out.is_empty() && write_half.write_all(&out).await.is_err() {
            return;
        }
    }
}
