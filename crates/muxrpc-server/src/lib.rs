//! MuxRPC Server
//!
//! This crate hosts unary and streaming method handlers behind the muxrpc
//! frame protocol. Every accepted TCP connection gets a server-side
//! [`Multiplexer`](muxrpc_common::Multiplexer); every call opened on it runs
//! on its own task.
//!
//! # Behavior
//!
//! - Unknown methods, and calls opened with a kind the method does not
//!   serve, finish with `INVALID_ARGUMENT`.
//! - A timeout sent by the client becomes a server-side deadline; handlers
//!   still running when it passes finish with `DEADLINE_EXCEEDED`.
//! - A CANCEL from the client abandons a unary handler immediately and
//!   surfaces as `CANCELLED` to streaming handlers.
//! - `_ping` is always registered and answers with an empty payload.

mod handler;
mod server;

pub use handler::{HandlerResult, ServerStream, StreamingFn, UnaryFn, UnaryRequest};
pub use server::{Server, ServerBuilder, PING_METHOD};
