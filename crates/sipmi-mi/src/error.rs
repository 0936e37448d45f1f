//! MI client error types.

use std::io;

use sipmi_protocol::{CodecError, RpcError};
use thiserror::Error;

/// Result type for MI operations.
pub type MiResult<T> = Result<T, MiError>;

/// Errors surfaced by [`crate::MiClient`].
#[derive(Debug, Error)]
pub enum MiError {
    /// The client was built with missing or invalid parameters.
    #[error("invalid MI configuration: {0}")]
    Config(String),

    /// The command never got a usable reply.
    #[error("error with connection: {0}. Is the server running?")]
    Connection(#[source] TransportError),

    /// The server replied with a JSON-RPC error.
    #[error("error executing command: {0}")]
    Command(#[source] RpcError),

    /// The command could not be serialized.
    #[error("failed to encode command: {0}")]
    Encode(#[source] serde_json::Error),
}

impl MiError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Returns the server-side error, if the server answered with one.
    pub fn rpc(&self) -> Option<&RpcError> {
        match self {
            Self::Command(err) => Some(err),
            _ => None,
        }
    }

    /// Returns true if the failure happened below the JSON-RPC layer.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<TransportError> for MiError {
    fn from(err: TransportError) -> Self {
        Self::Connection(err)
    }
}

impl From<CodecError> for MiError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Rpc(rpc) => Self::Command(rpc),
            CodecError::Serialization(e) => Self::Encode(e),
            malformed @ CodecError::Malformed { .. } => {
                Self::Connection(TransportError::MalformedReply(malformed))
            }
        }
    }
}

/// Failures of a single request/reply exchange.
#[derive(Debug, Error)]
pub enum TransportError {
    /// IO failure, annotated with what was being attempted.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// HTTP request failed or returned a non-success status.
    #[error("{0}")]
    Http(#[from] reqwest::Error),

    /// No reply within the configured timeout.
    #[error("timeout during {operation}")]
    Timeout { operation: String },

    /// The endpoint is missing or not accepting commands.
    #[error("{0}")]
    Unavailable(String),

    /// The wait for a reply was cancelled by the caller.
    #[error("interrupted while waiting for reply")]
    Interrupted,

    /// The reply arrived but is not JSON.
    #[error("{0}")]
    MalformedReply(#[source] CodecError),
}

impl TransportError {
    /// Wraps an IO error with a short description of the operation.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }
}
