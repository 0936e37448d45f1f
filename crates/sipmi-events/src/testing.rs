//! In-crate fakes for the MI client and the event transport.

use std::collections::VecDeque;
use std::net::UdpSocket;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};

use sipmi_mi::{MiExecutor, MiResult};

use crate::error::{EventError, EventResult};
use crate::transport::{Endpoint, Transport};

/// Records commands; replies from a queue, then `"OK"`.
#[derive(Default)]
pub(crate) struct FakeMi {
    calls: Mutex<Vec<(String, Value)>>,
    replies: Mutex<VecDeque<MiResult<Value>>>,
    latency: Duration,
}

impl FakeMi {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every command takes `latency` and is recorded when it completes.
    pub(crate) fn slow(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            ..Self::default()
        })
    }

    pub(crate) fn reply(&self, reply: MiResult<Value>) {
        self.replies.lock().push_back(reply);
    }

    pub(crate) fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }

    /// Lease argument of every `event_subscribe` so far.
    pub(crate) fn leases(&self) -> Vec<u64> {
        self.calls
            .lock()
            .iter()
            .filter_map(|(_, params)| params.get(2).and_then(Value::as_u64))
            .collect()
    }

    /// Endpoint argument of the first `event_subscribe`.
    pub(crate) fn endpoint(&self) -> Option<String> {
        self.calls
            .lock()
            .first()
            .and_then(|(_, params)| params.get(1))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

impl MiExecutor for FakeMi {
    fn execute(&self, method: &str, params: Option<Value>) -> MiResult<Value> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        self.calls
            .lock()
            .push((method.to_string(), params.unwrap_or(Value::Null)));
        self.replies.lock().pop_front().unwrap_or_else(|| Ok(json!("OK")))
    }
}

/// Test-side controls of a [`FakeTransport`].
pub(crate) struct FakeTransportHandle {
    feed: mpsc::Sender<Vec<u8>>,
    created: Arc<AtomicBool>,
    destroyed: Arc<AtomicUsize>,
}

impl FakeTransportHandle {
    pub(crate) fn feed(&self, data: &[u8]) {
        let _ = self.feed.send(data.to_vec());
    }

    pub(crate) fn created(&self) -> bool {
        self.created.load(Ordering::SeqCst)
    }

    /// Number of destroys that actually released the transport.
    pub(crate) fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

/// Transport fed from the test through a channel.
pub(crate) struct FakeTransport {
    chunks: mpsc::Receiver<Vec<u8>>,
    endpoint: Option<Endpoint>,
    created: Arc<AtomicBool>,
    destroyed: Arc<AtomicUsize>,
    /// Idle socket lent out as a pollable descriptor.
    socket: Option<UdpSocket>,
}

pub(crate) fn fake_transport() -> (Box<dyn Transport>, FakeTransportHandle) {
    fake(None)
}

/// Like [`fake_transport`], with a descriptor the reactor can register.
pub(crate) fn fake_pollable_transport() -> (Box<dyn Transport>, FakeTransportHandle) {
    let socket = UdpSocket::bind("127.0.0.1:0").expect("bind idle socket");
    fake(Some(socket))
}

fn fake(socket: Option<UdpSocket>) -> (Box<dyn Transport>, FakeTransportHandle) {
    let (feed, chunks) = mpsc::channel();
    let created = Arc::new(AtomicBool::new(false));
    let destroyed = Arc::new(AtomicUsize::new(0));
    let transport = FakeTransport {
        chunks,
        endpoint: None,
        created: created.clone(),
        destroyed: destroyed.clone(),
        socket,
    };
    (
        Box::new(transport),
        FakeTransportHandle {
            feed,
            created,
            destroyed,
        },
    )
}

impl Transport for FakeTransport {
    fn create(&mut self) -> EventResult<Endpoint> {
        let endpoint = Endpoint::Udp(([127, 0, 0, 1], 9999).into());
        self.created.store(true, Ordering::SeqCst);
        self.endpoint = Some(endpoint.clone());
        Ok(endpoint)
    }

    fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    fn read(&mut self) -> EventResult<Option<Vec<u8>>> {
        if self.endpoint.is_none() {
            return Err(EventError::transport(
                "transport is not created",
                std::io::Error::from(std::io::ErrorKind::NotConnected),
            ));
        }
        match self.chunks.recv_timeout(Duration::from_millis(10)) {
            Ok(data) => Ok(Some(data)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(Duration::from_millis(10));
                Ok(None)
            }
        }
    }

    fn destroy(&mut self) {
        if self.endpoint.take().is_some() {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn as_raw_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(|s| s.as_raw_fd())
    }

    fn set_nonblocking(&mut self, _nonblocking: bool) -> EventResult<()> {
        Ok(())
    }
}

impl Drop for FakeTransport {
    fn drop(&mut self) {
        self.destroy();
    }
}
