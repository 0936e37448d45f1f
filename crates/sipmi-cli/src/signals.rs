//! Termination signals for the long-running commands.

use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::info;

/// SIGINT and SIGTERM listeners.
///
/// Installed before any resource is acquired so a failure to install leaves
/// nothing behind.
pub struct ShutdownSignals {
    sigint: Signal,
    sigterm: Signal,
}

impl ShutdownSignals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    /// Waits for the next signal and returns its name.
    pub async fn recv(&mut self) -> &'static str {
        let name = tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
        };
        info!(signal = name, "Received signal, shutting down");
        name
    }
}
