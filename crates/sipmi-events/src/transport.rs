//! Receive-side sockets the server delivers events to.
//!
//! A [`Transport`] is created once per subscription, registered with the
//! server through its [`Endpoint`] name and destroyed when the subscription
//! ends. The engine only ever talks to the trait; the concrete variant is
//! picked by [`TransportConfig::build`].

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::debug;

use crate::datagram::DatagramTransport;
use crate::error::{EventError, EventResult};
use crate::stream::StreamTransport;

/// Bounded wait of a blocking [`Transport::read`].
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Largest single read: one datagram, or one stream connection.
pub const DEFAULT_BUFFER_SIZE: usize = 65536;

/// Address the server sends events to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Udp(SocketAddr),
    Tcp(SocketAddr),
    /// Local datagram socket, named by its bare path.
    Unix(PathBuf),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp(addr) => write!(f, "udp:{}:{}", addr.ip(), addr.port()),
            Self::Tcp(addr) => write!(f, "tcp:{}:{}", addr.ip(), addr.port()),
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A socket events are read from.
///
/// `destroy` must be idempotent; implementations also call it on drop.
pub trait Transport: Send {
    /// Binds the socket and returns its final endpoint.
    fn create(&mut self) -> EventResult<Endpoint>;

    /// Returns the endpoint once [`create`](Self::create) succeeded.
    fn endpoint(&self) -> Option<&Endpoint>;

    /// Returns the next chunk of bytes, or `None` when nothing arrived
    /// within the read timeout (or immediately, in non-blocking mode).
    fn read(&mut self) -> EventResult<Option<Vec<u8>>>;

    /// Closes the socket and removes any filesystem entry.
    fn destroy(&mut self);

    /// Raw descriptor used for readiness polling.
    fn as_raw_fd(&self) -> Option<RawFd>;

    /// Switches [`read`](Self::read) between bounded-wait and non-blocking.
    fn set_nonblocking(&mut self, nonblocking: bool) -> EventResult<()>;

    /// True while a non-blocking read left input half-read on a descriptor
    /// other than [`as_raw_fd`](Self::as_raw_fd). Callers polling for
    /// readiness must retry `read` periodically until it clears.
    fn has_pending(&self) -> bool {
        false
    }
}

/// Socket flavour used for events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportKind {
    #[default]
    Datagram,
    Stream,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Datagram => "datagram",
            Self::Stream => "stream",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "datagram" => Ok(Self::Datagram),
            "stream" => Ok(Self::Stream),
            other => Err(EventError::config(format!("invalid event type: {}", other))),
        }
    }
}

/// Parameters for the transports a handler creates.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub kind: TransportKind,
    /// Listen address; a wildcard is resolved to a concrete local address.
    pub ip: String,
    /// Listen port, `0` for an ephemeral one.
    pub port: u16,
    /// Local datagram socket path, instead of `ip`/`port`.
    pub unix_path: Option<PathBuf>,
    pub read_timeout: Duration,
    pub buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Datagram,
            ip: "0.0.0.0".to_string(),
            port: 0,
            unix_path: None,
            read_timeout: DEFAULT_READ_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl TransportConfig {
    /// UDP transport on `ip:port`.
    pub fn datagram(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            ..Default::default()
        }
    }

    /// TCP transport on `ip:port`.
    pub fn stream(ip: impl Into<String>, port: u16) -> Self {
        Self {
            kind: TransportKind::Stream,
            ip: ip.into(),
            port,
            ..Default::default()
        }
    }

    /// Local datagram transport bound at `path`.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self {
            unix_path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Builder: set the bounded read wait.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Builder: set the largest single read.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Checks the parameters without touching the network.
    pub fn validate(&self) -> EventResult<()> {
        if self.read_timeout.is_zero() {
            return Err(EventError::config("read timeout must be positive"));
        }
        if self.buffer_size == 0 {
            return Err(EventError::config("buffer size must be positive"));
        }
        match (&self.unix_path, self.kind) {
            (Some(_), TransportKind::Stream) => Err(EventError::config(
                "unix_path is only supported by the datagram transport",
            )),
            (Some(path), TransportKind::Datagram) if path.as_os_str().is_empty() => {
                Err(EventError::config("unix_path must not be empty"))
            }
            (Some(_), TransportKind::Datagram) => Ok(()),
            (None, _) => self.parse_ip().map(|_| ()),
        }
    }

    /// Builds an unbound transport for one subscription.
    pub fn build(&self) -> EventResult<Box<dyn Transport>> {
        self.validate()?;
        let transport: Box<dyn Transport> = match (&self.unix_path, self.kind) {
            (Some(path), _) => Box::new(DatagramTransport::unix(
                path.clone(),
                self.read_timeout,
                self.buffer_size,
            )),
            (None, TransportKind::Datagram) => Box::new(DatagramTransport::inet(
                SocketAddr::new(self.parse_ip()?, self.port),
                self.read_timeout,
                self.buffer_size,
            )),
            (None, TransportKind::Stream) => Box::new(StreamTransport::new(
                SocketAddr::new(self.parse_ip()?, self.port),
                self.read_timeout,
                self.buffer_size,
            )),
        };
        Ok(transport)
    }

    fn parse_ip(&self) -> EventResult<IpAddr> {
        if self.ip.is_empty() {
            return Err(EventError::config(format!(
                "ip is required for the {} transport",
                self.kind
            )));
        }
        self.ip
            .parse()
            .map_err(|_| EventError::config(format!("invalid listen ip: {}", self.ip)))
    }
}

/// Replaces a wildcard bind address with one the server can send to.
///
/// Uses the address the local host name resolves to, falling back to
/// loopback.
pub(crate) fn resolve_wildcard(addr: SocketAddr) -> SocketAddr {
    if !addr.ip().is_unspecified() {
        return addr;
    }

    let want_v4 = addr.is_ipv4();
    let resolved = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .and_then(|name| (name.as_str(), 0).to_socket_addrs().ok())
        .and_then(|mut addrs| addrs.find(|a| a.is_ipv4() == want_v4 && !a.ip().is_unspecified()))
        .map(|a| a.ip());

    let ip = resolved.unwrap_or(if want_v4 {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        IpAddr::V6(Ipv6Addr::LOCALHOST)
    });
    debug!(%ip, "resolved wildcard listen address");
    SocketAddr::new(ip, addr.port())
}
