//! Stream event transport: one TCP connection per event chunk.
//!
//! The server connects, writes, and closes. In blocking mode each
//! [`Transport::read`] accepts one connection and reads it to the end (or
//! until the buffer size is reached). In non-blocking mode connections are
//! accepted as they arrive and read a piece at a time; a read returns the
//! first connection that has finished.

use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::time::{Duration, Instant};

use tracing::debug;

use sipmi_core::wait_readable;

use crate::error::{EventError, EventResult};
use crate::transport::{Endpoint, Transport, resolve_wildcard};

/// TCP listening transport.
#[derive(Debug)]
pub struct StreamTransport {
    bind: SocketAddr,
    read_timeout: Duration,
    buffer_size: usize,
    listener: Option<TcpListener>,
    endpoint: Option<Endpoint>,
    nonblocking: bool,
    pending: Vec<PendingConnection>,
}

/// Accepted connection still being read in non-blocking mode.
#[derive(Debug)]
struct PendingConnection {
    conn: TcpStream,
    data: Vec<u8>,
    last_read: Instant,
}

impl PendingConnection {
    fn new(conn: TcpStream) -> Self {
        Self {
            conn,
            data: Vec::new(),
            last_read: Instant::now(),
        }
    }

    /// Reads what is available. Returns true once the peer closed, the
    /// buffer is full, or the connection sat idle for `idle`.
    fn fill(&mut self, buffer_size: usize, idle: Duration) -> io::Result<bool> {
        let mut chunk = [0u8; 4096];
        while self.data.len() < buffer_size {
            let want = chunk.len().min(buffer_size - self.data.len());
            match self.conn.read(&mut chunk[..want]) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    self.data.extend_from_slice(&chunk[..n]);
                    self.last_read = Instant::now();
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(self.last_read.elapsed() >= idle);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

impl StreamTransport {
    pub fn new(bind: SocketAddr, read_timeout: Duration, buffer_size: usize) -> Self {
        Self {
            bind,
            read_timeout,
            buffer_size,
            listener: None,
            endpoint: None,
            nonblocking: false,
            pending: Vec::new(),
        }
    }

    fn read_connection(&self, mut conn: TcpStream) -> io::Result<Vec<u8>> {
        // Accepted sockets do not inherit the listener's O_NONBLOCK.
        conn.set_nonblocking(false)?;
        conn.set_read_timeout(Some(self.read_timeout))?;

        let mut data = Vec::new();
        let mut chunk = vec![0u8; self.buffer_size.min(16384)];
        while data.len() < self.buffer_size {
            let want = chunk.len().min(self.buffer_size - data.len());
            match conn.read(&mut chunk[..want]) {
                Ok(0) => break,
                Ok(n) => data.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(data)
    }

    fn read_nonblocking(&mut self) -> EventResult<Option<Vec<u8>>> {
        let Some(listener) = &self.listener else {
            return Err(EventError::transport(
                "transport is not created",
                io::Error::from(io::ErrorKind::NotConnected),
            ));
        };

        loop {
            match listener.accept() {
                Ok((conn, peer)) => {
                    conn.set_nonblocking(true)
                        .map_err(|e| EventError::transport("could not change blocking mode", e))?;
                    debug!(%peer, "event connection accepted");
                    self.pending.push(PendingConnection::new(conn));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(EventError::transport("could not accept connection", e)),
            }
        }

        let mut i = 0;
        while i < self.pending.len() {
            let done = self.pending[i]
                .fill(self.buffer_size, self.read_timeout)
                .map_err(|e| EventError::transport("could not read event connection", e))?;
            if !done {
                i += 1;
                continue;
            }
            let finished = self.pending.remove(i);
            if !finished.data.is_empty() {
                return Ok(Some(finished.data));
            }
        }
        Ok(None)
    }
}

impl Transport for StreamTransport {
    fn create(&mut self) -> EventResult<Endpoint> {
        if let Some(endpoint) = &self.endpoint {
            return Ok(endpoint.clone());
        }

        let listener = TcpListener::bind(self.bind)
            .map_err(|e| EventError::transport(format!("could not bind {}", self.bind), e))?;
        let local = listener
            .local_addr()
            .map_err(|e| EventError::transport("could not read bound address", e))?;
        let endpoint = Endpoint::Tcp(resolve_wildcard(local));

        debug!(endpoint = %endpoint, "stream transport listening");
        self.listener = Some(listener);
        self.endpoint = Some(endpoint.clone());
        Ok(endpoint)
    }

    fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    fn read(&mut self) -> EventResult<Option<Vec<u8>>> {
        if self.nonblocking {
            return self.read_nonblocking();
        }
        let Some(listener) = &self.listener else {
            return Err(EventError::transport(
                "transport is not created",
                io::Error::from(io::ErrorKind::NotConnected),
            ));
        };

        let ready = wait_readable(listener.as_fd(), self.read_timeout)
            .map_err(|e| EventError::transport("could not wait for connection", e))?;
        if !ready {
            return Ok(None);
        }

        let conn = match listener.accept() {
            Ok((conn, peer)) => {
                debug!(%peer, "event connection accepted");
                conn
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                return Ok(None);
            }
            Err(e) => return Err(EventError::transport("could not accept connection", e)),
        };

        let data = self
            .read_connection(conn)
            .map_err(|e| EventError::transport("could not read event connection", e))?;
        Ok((!data.is_empty()).then_some(data))
    }

    fn destroy(&mut self) {
        self.pending.clear();
        if self.listener.take().is_some() {
            debug!(endpoint = ?self.endpoint, "stream transport destroyed");
        }
    }

    fn as_raw_fd(&self) -> Option<RawFd> {
        self.listener.as_ref().map(|l| l.as_raw_fd())
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> EventResult<()> {
        if let Some(listener) = &self.listener {
            listener
                .set_nonblocking(nonblocking)
                .map_err(|e| EventError::transport("could not change blocking mode", e))?;
        }
        self.nonblocking = nonblocking;
        Ok(())
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.destroy();
    }
}
