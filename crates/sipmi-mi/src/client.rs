//! The [`MiClient`] facade over the configured connector.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use serde_json::Value;
use tracing::{debug, warn};

use sipmi_protocol::{decode_reply, encode_command};

use crate::config::{ConnectorKind, MiConfig};
use crate::connector::{Connector, Validation};
use crate::datagram::DatagramConnector;
use crate::error::MiResult;
use crate::http::HttpConnector;

/// Anything that can run an MI command.
///
/// Implemented by [`MiClient`]; consumers such as the event subscriber take
/// this trait so they can be driven by a fake in tests.
pub trait MiExecutor: Send + Sync {
    /// Runs `method` with `params` and returns the `result` member of the reply.
    fn execute(&self, method: &str, params: Option<Value>) -> MiResult<Value>;
}

/// Cancels a pending reply wait from another thread.
///
/// An interrupt cancels one exchange: the one waiting, or the next one if
/// none is. Observing it clears it. Only the FIFO connector blocks long
/// enough to need it; the others are bounded by short timeouts.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    /// Asks the in-flight exchange to stop waiting.
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Clears a previous interrupt so the client can be reused.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clears the flag, returning whether it was set.
    pub(crate) fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Management interface client.
///
/// Owns one connector chosen at construction. Each [`execute`](Self::execute)
/// is an independent request/reply exchange, so a client can be shared
/// between threads.
pub struct MiClient {
    connector: Box<dyn Connector>,
    validation: OnceLock<Validation>,
    interrupt: InterruptHandle,
}

impl MiClient {
    /// Creates a client for the given configuration.
    ///
    /// Fails with [`crate::MiError::Config`] when required parameters are
    /// missing. No connection is attempted.
    pub fn new(config: MiConfig) -> MiResult<Self> {
        config.validate()?;
        let interrupt = InterruptHandle::default();

        let connector: Box<dyn Connector> = match config {
            #[cfg(unix)]
            MiConfig::Fifo(c) => Box::new(crate::fifo::FifoConnector::new(c, interrupt.clone())),
            #[cfg(not(unix))]
            MiConfig::Fifo(_) => {
                return Err(crate::MiError::config(
                    "the FIFO connector is only available on unix",
                ));
            }
            MiConfig::Datagram(c) => Box::new(DatagramConnector::new(c)),
            MiConfig::Http(c) => Box::new(HttpConnector::new(c)?),
        };

        debug!(connector = %connector.kind(), "MI client created");
        Ok(Self {
            connector,
            validation: OnceLock::new(),
            interrupt,
        })
    }

    /// Creates a client over a caller-supplied connector.
    pub fn with_connector(connector: Box<dyn Connector>) -> Self {
        Self {
            connector,
            validation: OnceLock::new(),
            interrupt: InterruptHandle::default(),
        }
    }

    /// Returns the connector kind.
    pub fn kind(&self) -> ConnectorKind {
        self.connector.kind()
    }

    /// Returns a handle that cancels a pending FIFO reply wait.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    /// Probes the endpoint once and caches the outcome.
    pub fn valid(&self) -> &Validation {
        self.validation.get_or_init(|| {
            let validation = self.connector.valid();
            if !validation.is_ok() {
                for line in validation.diagnostics() {
                    warn!(connector = %self.connector.kind(), "{}", line);
                }
            }
            validation
        })
    }

    /// Runs one command and returns its `result`.
    pub fn execute(&self, method: &str, params: Option<Value>) -> MiResult<Value> {
        let request = encode_command(method, params)?;
        debug!(method, connector = %self.connector.kind(), "executing MI command");

        let reply = self.connector.exchange(&request)?;
        let result = decode_reply(&reply)?;
        debug!(method, "MI command succeeded");
        Ok(result)
    }
}

impl MiExecutor for MiClient {
    fn execute(&self, method: &str, params: Option<Value>) -> MiResult<Value> {
        MiClient::execute(self, method, params)
    }
}

impl std::fmt::Debug for MiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiClient")
            .field("connector", &self.connector.kind())
            .finish_non_exhaustive()
    }
}
