use thiserror::Error;

use crate::protocol::status::{Status, StatusCode};

#[derive(Error, Debug)]
pub enum MuxrpcError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection pool for {endpoint} exhausted after {waited_ms}ms")]
    PoolExhausted { endpoint: String, waited_ms: u64 },

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("Call cancelled")]
    Cancelled,

    #[error("Circuit open for endpoint {0}")]
    CircuitOpen(String),

    #[error("Rejected by interceptor '{interceptor}': {status}")]
    InterceptorRejected { interceptor: String, status: Status },

    #[error("Remote error: {0}")]
    Remote(Status),

    #[error("Invalid call state: {0}")]
    InvalidCallState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MuxrpcError {
    /// Maps this error onto the status a caller observes.
    pub fn status(&self) -> Status {
        match self {
            MuxrpcError::Transport(msg) => Status::unavailable(msg.clone()),
            MuxrpcError::Protocol(msg) => Status::internal(format!("protocol error: {msg}")),
            MuxrpcError::PoolExhausted { .. } => Status::unavailable(self.to_string()),
            MuxrpcError::DeadlineExceeded(msg) => Status::deadline_exceeded(msg.clone()),
            MuxrpcError::Cancelled => Status::cancelled("call cancelled"),
            MuxrpcError::CircuitOpen(_) => Status::circuit_open(self.to_string()),
            MuxrpcError::InterceptorRejected { status, .. } => status.clone(),
            MuxrpcError::Remote(status) => status.clone(),
            MuxrpcError::InvalidCallState(msg) => Status::internal(msg.clone()),
            MuxrpcError::InvalidArgument(msg) => Status::invalid_argument(msg.clone()),
            MuxrpcError::Io(err) => Status::unavailable(err.to_string()),
            MuxrpcError::Json(err) => Status::internal(err.to_string()),
        }
    }

    pub fn code(&self) -> StatusCode {
        self.status().code
    }

    /// True for failures that say something about the health of the
    /// endpoint: broken connections, protocol violations and remote
    /// `UNAVAILABLE`. These feed the circuit breaker.
    pub fn is_transport_failure(&self) -> bool {
        match self {
            MuxrpcError::Transport(_) | MuxrpcError::Protocol(_) | MuxrpcError::Io(_) => true,
            MuxrpcError::Remote(status) => status.code == StatusCode::Unavailable,
            _ => false,
        }
    }

    /// True when the connection that produced this error can no longer carry calls.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            MuxrpcError::Transport(_) | MuxrpcError::Protocol(_) | MuxrpcError::Io(_)
        )
    }
}

impl From<MuxrpcError> for Status {
    fn from(err: MuxrpcError) -> Self {
        err.status()
    }
}

pub type Result<T> = std::result::Result<T, MuxrpcError>;
