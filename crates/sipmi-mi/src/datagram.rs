//! Datagram connector: one command per datagram, one reply datagram back.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
#[cfg(unix)]
use std::os::unix::net::UnixDatagram;

use tracing::debug;

use crate::config::{ConnectorKind, DatagramConfig, DatagramTarget};
use crate::connector::{Connector, Validation};
use crate::error::TransportError;

#[cfg(unix)]
const REPLY_PREFIX: &str = "sipmi_mi_reply";

/// Connector sending commands over UDP or a unix datagram socket.
#[derive(Debug)]
pub struct DatagramConnector {
    config: DatagramConfig,
}

impl DatagramConnector {
    pub fn new(config: DatagramConfig) -> Self {
        Self { config }
    }

    fn exchange_inet(&self, host: &str, port: u16, request: &str) -> Result<String, TransportError> {
        let target = resolve(host, port)?;
        let bind: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(bind)
            .map_err(|e| TransportError::io("could not bind datagram socket", e))?;
        socket
            .set_read_timeout(Some(self.config.timeout))
            .map_err(|e| TransportError::io("could not set datagram timeout", e))?;

        socket
            .send_to(request.as_bytes(), target)
            .map_err(|e| TransportError::io(format!("could not send to {}", target), e))?;
        debug!(%target, bytes = request.len(), "datagram sent");

        let mut buf = vec![0u8; self.config.buffer_size];
        let n = socket.recv(&mut buf).map_err(recv_error)?;
        Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
    }

    #[cfg(unix)]
    fn exchange_unix(&self, path: &std::path::Path, request: &str) -> Result<String, TransportError> {
        let reply_path = self
            .config
            .reply_dir
            .join(format!("{}_{}", REPLY_PREFIX, uuid::Uuid::new_v4().simple()));

        let socket = UnixDatagram::bind(&reply_path).map_err(|e| {
            TransportError::io(format!("could not bind {}", reply_path.display()), e)
        })?;
        let _guard = crate::guard::ScopedPath::new(reply_path);

        socket
            .set_read_timeout(Some(self.config.timeout))
            .map_err(|e| TransportError::io("could not set datagram timeout", e))?;
        socket
            .send_to(request.as_bytes(), path)
            .map_err(|e| TransportError::io(format!("could not send to {}", path.display()), e))?;
        debug!(target = %path.display(), bytes = request.len(), "datagram sent");

        let mut buf = vec![0u8; self.config.buffer_size];
        let n = socket.recv(&mut buf).map_err(recv_error)?;
        Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
    }
}

impl Connector for DatagramConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Datagram
    }

    fn exchange(&self, request: &str) -> Result<String, TransportError> {
        match &self.config.target {
            DatagramTarget::Inet { host, port } => self.exchange_inet(host, *port, request),
            #[cfg(unix)]
            DatagramTarget::Unix(path) => self.exchange_unix(path, request),
            #[cfg(not(unix))]
            DatagramTarget::Unix(_) => Err(TransportError::Unavailable(
                "unix datagram sockets are not supported on this platform".to_string(),
            )),
        }
    }

    /// Datagrams are connectionless; there is nothing to probe.
    fn valid(&self) -> Validation {
        Validation::valid()
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::io(format!("could not resolve {}:{}", host, port), e))?
        .next()
        .ok_or_else(|| TransportError::Unavailable(format!("no address for {}:{}", host, port)))
}

fn recv_error(e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            TransportError::timeout("waiting for datagram reply")
        }
        _ => TransportError::io("could not receive datagram reply", e),
    }
}
