//! The [`Connector`] trait implemented by every MI transport.

use crate::config::ConnectorKind;
use crate::error::TransportError;

/// Outcome of a reachability probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    ok: bool,
    diagnostics: Vec<String>,
}

impl Validation {
    /// The endpoint looks usable.
    pub fn valid() -> Self {
        Self {
            ok: true,
            diagnostics: Vec::new(),
        }
    }

    /// The endpoint is unusable; `diagnostics` explain why, one line each.
    pub fn invalid(diagnostics: Vec<String>) -> Self {
        Self {
            ok: false,
            diagnostics,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }
}

/// A request/reply transport to the management interface.
///
/// Connectors move opaque text: encoding the command and decoding the reply
/// is done once, by [`crate::MiClient`].
pub trait Connector: Send + Sync {
    /// Returns which transport this is.
    fn kind(&self) -> ConnectorKind;

    /// Sends one encoded command and returns the raw reply text.
    ///
    /// Blocks for at most the connector's configured timeout.
    fn exchange(&self, request: &str) -> Result<String, TransportError>;

    /// Performs a lightweight reachability probe.
    fn valid(&self) -> Validation;
}
