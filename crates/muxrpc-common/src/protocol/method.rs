use serde::{Deserialize, Serialize};

/// Shape of a call: how many messages flow in each direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Unary,
    ServerStream,
    ClientStream,
    BidiStream,
}

impl CallKind {
    /// Whether the client may send more than one message.
    pub fn client_streams(self) -> bool {
        matches!(self, CallKind::ClientStream | CallKind::BidiStream)
    }

    /// Whether the server may answer with more than one message.
    pub fn server_streams(self) -> bool {
        matches!(self, CallKind::ServerStream | CallKind::BidiStream)
    }
}

/// Names a remote method and the shape of calls made to it.
///
/// Payloads are opaque byte buffers; the descriptor carries no schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    pub name: String,
    pub kind: CallKind,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>, kind: CallKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn unary(name: impl Into<String>) -> Self {
        Self::new(name, CallKind::Unary)
    }

    pub fn server_stream(name: impl Into<String>) -> Self {
        Self::new(name, CallKind::ServerStream)
    }

    pub fn client_stream(name: impl Into<String>) -> Self {
        Self::new(name, CallKind::ClientStream)
    }

    pub fn bidi_stream(name: impl Into<String>) -> Self {
        Self::new(name, CallKind::BidiStream)
    }
}
