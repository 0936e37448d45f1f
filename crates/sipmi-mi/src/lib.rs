//! Management interface (MI) client.
//!
//! The server accepts the same JSON-RPC commands over three transports:
//!
//! - **FIFO**: a well-known request pipe plus one throwaway reply pipe per
//!   command ([`FifoConnector`]).
//! - **Datagram**: one UDP or unix datagram per command and one per reply
//!   ([`DatagramConnector`]).
//! - **HTTP**: a POST per command ([`HttpConnector`]).
//!
//! [`MiClient`] picks the connector from an [`MiConfig`], encodes commands,
//! decodes replies and turns failures into [`MiError`].
//!
//! # Example
//!
//! ```rust,no_run
//! use sipmi_mi::{FifoConfig, MiClient, MiConfig};
//!
//! let client = MiClient::new(MiConfig::Fifo(FifoConfig::default()))?;
//! let uptime = client.execute("uptime", None)?;
//! println!("{uptime}");
//! # Ok::<(), sipmi_mi::MiError>(())
//! ```

mod client;
mod config;
mod connector;
mod datagram;
mod error;
#[cfg(unix)]
mod fifo;
mod guard;
mod http;

pub use client::{InterruptHandle, MiClient, MiExecutor};
pub use config::{
    ConnectorKind, DatagramConfig, DatagramTarget, FifoConfig, HttpConfig, MiConfig,
    DEFAULT_FIFO_FALLBACK, DEFAULT_FIFO_FILE, DEFAULT_FIFO_REPLY_DIR,
};
pub use connector::{Connector, Validation};
pub use datagram::DatagramConnector;
pub use error::{MiError, MiResult, TransportError};
#[cfg(unix)]
pub use fifo::FifoConnector;
pub use http::HttpConnector;
