//! Event subscription error types.

use std::io;

use sipmi_mi::MiError;
use sipmi_protocol::FramingError;
use thiserror::Error;

/// Result type for event operations.
pub type EventResult<T> = Result<T, EventError>;

/// Errors that can occur while subscribing to or receiving events.
#[derive(Debug, Error)]
pub enum EventError {
    /// Missing or inconsistent construction parameters.
    #[error("invalid event configuration: {0}")]
    InvalidConfig(String),

    /// Socket failure on the receiving side.
    #[error("{context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The event stream could not be split into messages.
    #[error(transparent)]
    Framing(#[from] FramingError),

    /// The server did not acknowledge the subscription change.
    #[error("could not subscribe for event {event}: {reason}")]
    Subscription { event: String, reason: String },

    /// The subscription command itself failed.
    #[error("could not subscribe for event {event}: {source}")]
    Mi {
        event: String,
        #[source]
        source: MiError,
    },

    /// An active subscription with the same name already exists.
    #[error("already subscribed for event {0}")]
    AlreadySubscribed(String),

    /// No active subscription with that name.
    #[error("not subscribed for event {0}")]
    NotSubscribed(String),

    /// `unsubscribe` was called a second time.
    #[error("event {0} is already unsubscribed")]
    AlreadyUnsubscribed(String),

    /// The operation needs a different execution context.
    #[error("{0}")]
    WrongRuntime(String),
}

impl EventError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Wraps an IO error with a short description of the operation.
    pub fn transport(context: impl Into<String>, source: io::Error) -> Self {
        Self::Transport {
            context: context.into(),
            source,
        }
    }

    /// Returns true if the server refused, or never answered, a subscription
    /// change.
    pub fn is_subscription(&self) -> bool {
        matches!(self, Self::Subscription { .. } | Self::Mi { .. })
    }
}
