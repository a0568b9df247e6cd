use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::protocol::error::MuxrpcError;
use crate::protocol::metadata::Metadata;
use crate::protocol::method::CallKind;
use crate::protocol::status::Status;

/// Call identifier, unique per connection and allocated by the client side.
pub type CallId = u64;

/// Frame type tag as written on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Open = 1,
    Data = 2,
    HalfClose = 3,
    Status = 4,
    Cancel = 5,
    WindowUpdate = 6,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxrpcError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameType::Open),
            2 => Ok(FrameType::Data),
            3 => Ok(FrameType::HalfClose),
            4 => Ok(FrameType::Status),
            5 => Ok(FrameType::Cancel),
            6 => Ok(FrameType::WindowUpdate),
            other => Err(MuxrpcError::Protocol(format!("unknown frame type {other}"))),
        }
    }
}

/// Body of an OPEN frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenHeader {
    pub method: String,
    pub kind: CallKind,
    #[serde(default)]
    pub metadata: Metadata,
    /// Time budget left for the call when it was opened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl OpenHeader {
    pub fn new(method: impl Into<String>, kind: CallKind) -> Self {
        Self {
            method: method.into(),
            kind,
            metadata: Metadata::new(),
            timeout_ms: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// One unit of the wire protocol.
///
/// Every frame belongs to exactly one call. Frames for the same call are
/// delivered in the order they were written.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Starts a call (client to server).
    Open { call_id: CallId, header: OpenHeader },
    /// One opaque message.
    Data { call_id: CallId, payload: Bytes },
    /// Sender will write no more DATA for this call.
    HalfClose { call_id: CallId },
    /// Final status (server to client). Terminates the call.
    Status { call_id: CallId, status: Status },
    /// Client abandoned the call. Terminates the call.
    Cancel { call_id: CallId },
    /// Grants the peer permission to send `credit` more DATA frames.
    WindowUpdate { call_id: CallId, credit: u32 },
}

impl Frame {
    pub fn call_id(&self) -> CallId {
        match self {
            Frame::Open { call_id, .. }
            | Frame::Data { call_id, .. }
            | Frame::HalfClose { call_id }
            | Frame::Status { call_id, .. }
            | Frame::Cancel { call_id }
            | Frame::WindowUpdate { call_id, .. } => *call_id,
        }
    }

    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Open { .. } => FrameType::Open,
            Frame::Data { .. } => FrameType::Data,
            Frame::HalfClose { .. } => FrameType::HalfClose,
            Frame::Status { .. } => FrameType::Status,
            Frame::Cancel { .. } => FrameType::Cancel,
            Frame::WindowUpdate { .. } => FrameType::WindowUpdate,
        }
    }
}
