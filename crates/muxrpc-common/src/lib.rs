//! MuxRPC Common Types and Transport
//!
//! This crate provides the status model, wire frames and the stream
//! multiplexer shared by every muxrpc component.
//!
//! # Overview
//!
//! MuxRPC runs many concurrent calls over a small number of long-lived TCP
//! connections. This crate contains the pieces both peers need:
//!
//! - **Protocol Layer**: status codes, errors, metadata, method descriptors and frames
//! - **Transport Layer**: the frame codec, TCP connect helpers and the [`Multiplexer`]
//!
//! # Architecture
//!
//! The wire protocol is a sequence of frames, each tagged with the call it
//! belongs to:
//! - **Transport**: TCP, one multiplexed connection carries many calls
//! - **Frame Format**: `[u32 BE length][u64 BE call id][u8 frame type][body]`
//! - **Headers**: OPEN and STATUS bodies are JSON, DATA bodies are opaque bytes
//! - **Max Frame Size**: 16 MiB by default (prevents memory exhaustion)
//!
//! # Components
//!
//! - [`protocol`] - Status, error, metadata and frame types
//! - [`transport`] - Codec, TCP transport and multiplexer
//!
//! # Example
//!
//! ```no_run
//! use muxrpc_common::{Metadata, Status, StatusCode};
//!
//! let mut metadata = Metadata::new();
//! metadata.append("authorization", "Bearer abc");
//!
//! let status = Status::new(StatusCode::Unavailable, "node restarting");
//! assert!(status.code.is_retryable_by_default());
//! ```

pub mod protocol;
pub mod transport;

pub use protocol::*;
pub use transport::{Inbound, MuxConfig, MuxStream, Multiplexer, Responder, Role};
