//! Protocol error types.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Structured error carried by a JSON-RPC reply.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcError {
    /// Numeric error code.
    pub code: i64,
    /// Human readable message.
    pub message: String,
    /// Optional structured detail.
    pub data: Option<Value>,
}

impl RpcError {
    /// Creates an error without detail data.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Builder: attach detail data.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Error raised for replies that have neither `result` nor `error`.
    pub fn internal() -> Self {
        Self::new(crate::INTERNAL_ERROR_CODE, "Internal error")
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        match &self.data {
            None | Some(Value::Null) => Ok(()),
            Some(Value::String(s)) if s.is_empty() => Ok(()),
            Some(Value::String(s)) => write!(f, " ({})", s),
            Some(data) => write!(f, " ({})", data),
        }
    }
}

impl std::error::Error for RpcError {}

/// Errors produced while encoding commands or decoding replies.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The reply is well-formed but reports a failure.
    #[error("{0}")]
    Rpc(RpcError),

    /// The reply could not be parsed as JSON at all.
    #[error("could not decode json: '{reply}'")]
    Malformed {
        reply: String,
        #[source]
        source: serde_json::Error,
    },

    /// The command could not be serialized.
    #[error("failed to serialize command: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CodecError {
    /// Returns the structured reply error, if this is one.
    pub fn as_rpc(&self) -> Option<&RpcError> {
        match self {
            Self::Rpc(err) => Some(err),
            _ => None,
        }
    }
}

/// Terminal failure of a [`crate::FrameBuffer`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// Too many consecutive pushes produced no complete message.
    #[error("no complete message after {attempts} consecutive reads")]
    MaxAttempts { attempts: u32 },
}
