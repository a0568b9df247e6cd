use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical outcome codes carried by every finished call.
///
/// The set is deliberately small. Codes travel on the wire inside STATUS
/// frames as their `SCREAMING_SNAKE_CASE` names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Ok,
    Cancelled,
    DeadlineExceeded,
    Unavailable,
    InvalidArgument,
    Internal,
    CircuitOpen,
}

impl StatusCode {
    /// Every code, in wire order.
    pub const ALL: [StatusCode; 7] = [
        StatusCode::Ok,
        StatusCode::Cancelled,
        StatusCode::DeadlineExceeded,
        StatusCode::Unavailable,
        StatusCode::InvalidArgument,
        StatusCode::Internal,
        StatusCode::CircuitOpen,
    ];

    /// Codes that a default retry policy treats as transient.
    pub fn is_retryable_by_default(self) -> bool {
        matches!(self, StatusCode::Unavailable | StatusCode::DeadlineExceeded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::Internal => "INTERNAL",
            StatusCode::CircuitOpen => "CIRCUIT_OPEN",
        }
    }

    /// Position of this code in [`StatusCode::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final outcome of a call: a code plus a human readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    #[serde(default)]
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Cancelled, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(StatusCode::DeadlineExceeded, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CircuitOpen, message)
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}
