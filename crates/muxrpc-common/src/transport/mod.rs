//! MuxRPC Transport Layer
//!
//! This module turns byte streams into multiplexed call streams.
//!
//! # Architecture
//!
//! - **Transport**: TCP, dialed with [`TcpTransport`]
//! - **Codec**: [`FrameCodec`] encodes and decodes frames for `tokio_util::codec`
//! - **Multiplexer**: [`Multiplexer`] runs one reader and one writer task per
//!   connection and hands each call its own [`MuxStream`]
//!
//! # Frame Size Limits
//!
//! Frames larger than [`MuxConfig::max_frame_size`] (16 MiB by default) are
//! rejected on both the read and the write path.
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use muxrpc_common::transport::{Inbound, Multiplexer, MuxConfig, TcpTransport};
//! use muxrpc_common::{CallKind, OpenHeader};
//!
//! # async fn demo() -> muxrpc_common::Result<()> {
//! let stream = TcpTransport::new().connect("127.0.0.1:7000").await?;
//! let mux = Multiplexer::client(stream, MuxConfig::default());
//!
//! let mut call = mux.open(OpenHeader::new("echo", CallKind::Unary)).await?;
//! call.send(Bytes::from_static(b"hello")).await?;
//! call.half_close().await?;
//! while let Some(item) = call.recv().await {
//!     if let Inbound::Status(status) = item {
//!         println!("finished with {status}");
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod mux;
pub mod tcp;

pub use codec::{FrameCodec, DEFAULT_MAX_FRAME_SIZE};
pub use mux::{Inbound, MuxConfig, MuxStream, Multiplexer, Responder, Role};
pub use tcp::TcpTransport;
