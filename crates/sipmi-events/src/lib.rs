//! Subscriptions to events pushed by the SIP server.
//!
//! The server pushes events to a socket the client owns. A subscription:
//!
//! 1. binds a [`Transport`] (UDP, unix datagram or TCP),
//! 2. registers its [`Endpoint`] with `event_subscribe [name, endpoint, lease]`,
//! 3. reassembles the incoming bytes into JSON events,
//! 4. keeps the lease alive, and finally cancels it with a lease of `0`.
//!
//! Two scheduling models are provided: [`Subscription`] (reader and renewal
//! threads) and [`AsyncSubscription`] (tokio reactor). [`EventHandler`]
//! manages either kind by event name.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use sipmi_events::{Delivery, EventHandler, SubscribeOptions, TransportConfig};
//! use sipmi_mi::{FifoConfig, MiClient, MiConfig};
//!
//! let mi = Arc::new(MiClient::new(MiConfig::Fifo(FifoConfig::default()))?);
//! let handler = EventHandler::new(mi, TransportConfig::datagram("0.0.0.0", 0))?;
//! handler.subscribe("E_PIKE_BLOCKED", SubscribeOptions::default(), |delivery| {
//!     match delivery {
//!         Delivery::Event(event) => println!("{event}"),
//!         Delivery::Closed => eprintln!("subscription closed"),
//!     }
//! })?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod async_subscription;
mod datagram;
mod error;
mod handler;
mod lease;
mod stream;
mod subscription;
#[cfg(test)]
mod testing;
mod transport;

pub use async_subscription::AsyncSubscription;
pub use datagram::DatagramTransport;
pub use error::{EventError, EventResult};
pub use handler::EventHandler;
pub use lease::{DEFAULT_LEASE, DEFAULT_RENEWAL_MARGIN, Lease, LeaseConfig};
pub use stream::StreamTransport;
pub use subscription::{Callback, Delivery, SUBSCRIBE_METHOD, SubscribeOptions, Subscription};
pub use transport::{
    DEFAULT_BUFFER_SIZE, DEFAULT_READ_TIMEOUT, Endpoint, Transport, TransportConfig, TransportKind,
};
