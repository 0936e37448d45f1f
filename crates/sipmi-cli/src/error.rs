//! CLI error types.

use std::fmt;

use sipmi_events::EventError;
use sipmi_mi::MiError;

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

/// Errors that end a `sipmi` invocation.
#[derive(Debug)]
pub enum CliError {
    /// Configuration file or flag error.
    Config(String),
    /// Invalid combination of arguments.
    Usage(String),
    /// Management command failed.
    Mi(MiError),
    /// Event subscription failed.
    Event(EventError),
    /// The subscription ended without being asked to.
    Closed(String),
    /// The health probe found a problem; diagnostics were already printed.
    Unhealthy,
    /// Failure that must not print anything (shell completion).
    Silent,
    /// IO error.
    Io(std::io::Error),
}

impl CliError {
    /// Returns true if nothing should be printed for this error.
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::Silent | Self::Unhealthy)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::Usage(msg) => write!(f, "{}", msg),
            Self::Mi(err) => write!(f, "{}", err),
            Self::Event(err) => write!(f, "{}", err),
            Self::Closed(event) => write!(f, "subscription to {} was closed", event),
            Self::Unhealthy => write!(f, "management interface is not usable"),
            Self::Silent => Ok(()),
            Self::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Mi(err) => Some(err),
            Self::Event(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<MiError> for CliError {
    fn from(err: MiError) -> Self {
        Self::Mi(err)
    }
}

impl From<EventError> for CliError {
    fn from(err: EventError) -> Self {
        Self::Event(err)
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
