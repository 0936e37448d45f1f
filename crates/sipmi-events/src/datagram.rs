//! Datagram event transport: one event chunk per UDP or local datagram.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{EventError, EventResult};
use crate::transport::{Endpoint, Transport, resolve_wildcard};

#[derive(Debug)]
enum Bind {
    Inet(SocketAddr),
    Unix(PathBuf),
}

#[derive(Debug)]
enum Socket {
    Inet(UdpSocket),
    Unix(UnixDatagram),
}

/// Datagram transport over UDP or a unix datagram socket.
#[derive(Debug)]
pub struct DatagramTransport {
    bind: Bind,
    read_timeout: Duration,
    buffer_size: usize,
    socket: Option<Socket>,
    endpoint: Option<Endpoint>,
    nonblocking: bool,
}

impl DatagramTransport {
    pub fn inet(addr: SocketAddr, read_timeout: Duration, buffer_size: usize) -> Self {
        Self::with_bind(Bind::Inet(addr), read_timeout, buffer_size)
    }

    pub fn unix(path: PathBuf, read_timeout: Duration, buffer_size: usize) -> Self {
        Self::with_bind(Bind::Unix(path), read_timeout, buffer_size)
    }

    fn with_bind(bind: Bind, read_timeout: Duration, buffer_size: usize) -> Self {
        Self {
            bind,
            read_timeout,
            buffer_size,
            socket: None,
            endpoint: None,
            nonblocking: false,
        }
    }
}

impl Transport for DatagramTransport {
    fn create(&mut self) -> EventResult<Endpoint> {
        if let Some(endpoint) = &self.endpoint {
            return Ok(endpoint.clone());
        }

        let (socket, endpoint) = match &self.bind {
            Bind::Inet(addr) => {
                let socket = UdpSocket::bind(addr)
                    .map_err(|e| EventError::transport(format!("could not bind {}", addr), e))?;
                socket
                    .set_read_timeout(Some(self.read_timeout))
                    .map_err(|e| EventError::transport("could not set read timeout", e))?;
                let local = socket
                    .local_addr()
                    .map_err(|e| EventError::transport("could not read bound address", e))?;
                (Socket::Inet(socket), Endpoint::Udp(resolve_wildcard(local)))
            }
            Bind::Unix(path) => {
                let socket = UnixDatagram::bind(path).map_err(|e| {
                    EventError::transport(format!("could not bind {}", path.display()), e)
                })?;
                socket
                    .set_read_timeout(Some(self.read_timeout))
                    .map_err(|e| EventError::transport("could not set read timeout", e))?;
                (Socket::Unix(socket), Endpoint::Unix(path.clone()))
            }
        };

        debug!(endpoint = %endpoint, "datagram transport bound");
        self.socket = Some(socket);
        self.endpoint = Some(endpoint.clone());
        Ok(endpoint)
    }

    fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    fn read(&mut self) -> EventResult<Option<Vec<u8>>> {
        let Some(socket) = &self.socket else {
            return Err(EventError::transport(
                "transport is not created",
                io::Error::from(io::ErrorKind::NotConnected),
            ));
        };

        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let received = match socket {
                Socket::Inet(s) => s.recv(&mut buf),
                Socket::Unix(s) => s.recv(&mut buf),
            };
            match received {
                Ok(0) if self.nonblocking => continue,
                Ok(0) => return Ok(None),
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(Some(buf));
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    return Ok(None);
                }
                Err(e) => return Err(EventError::transport("could not receive event", e)),
            }
        }
    }

    fn destroy(&mut self) {
        if self.socket.take().is_none() {
            return;
        }
        if let Bind::Unix(path) = &self.bind {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove event socket"),
            }
        }
        debug!(endpoint = ?self.endpoint, "datagram transport destroyed");
    }

    fn as_raw_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(|s| match s {
            Socket::Inet(s) => s.as_raw_fd(),
            Socket::Unix(s) => s.as_raw_fd(),
        })
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> EventResult<()> {
        if let Some(socket) = &self.socket {
            match socket {
                Socket::Inet(s) => s.set_nonblocking(nonblocking),
                Socket::Unix(s) => s.set_nonblocking(nonblocking),
            }
            .map_err(|e| EventError::transport("could not change blocking mode", e))?;
        }
        self.nonblocking = nonblocking;
        Ok(())
    }
}

impl Drop for DatagramTransport {
    fn drop(&mut self) {
        self.destroy();
    }
}
