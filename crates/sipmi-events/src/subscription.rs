//! Event subscriptions, threaded model.
//!
//! A [`Subscription`] owns one [`Transport`] and runs two background
//! threads:
//!
//! - a reader that drains the transport through a [`FrameBuffer`] and hands
//!   every decoded event to the callback;
//! - for automatic leases, a renewer that re-issues `event_subscribe` shortly
//!   before the lease runs out.
//!
//! The threads share only the lease timestamp and a few flags. Every
//! self-initiated end (framing failure, lease expiry, renewal failure, read
//! failure) delivers [`Delivery::Closed`] exactly once. An explicit
//! [`Subscription::unsubscribe`] delivers nothing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use sipmi_mi::MiExecutor;
use sipmi_protocol::{DEFAULT_MAX_RETRIES, FrameBuffer};

use crate::error::{EventError, EventResult};
use crate::lease::{Lease, LeaseConfig};
use crate::transport::{Endpoint, Transport};

/// MI command that registers, renews and cancels subscriptions.
pub const SUBSCRIBE_METHOD: &str = "event_subscribe";

/// What a subscription hands to its callback.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// One event as sent by the server.
    Event(Value),
    /// The subscription ended on its own; no further deliveries follow.
    Closed,
}

impl Delivery {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub fn into_event(self) -> Option<Value> {
        match self {
            Self::Event(value) => Some(value),
            Self::Closed => None,
        }
    }
}

/// Event callback. Runs on the subscription's reader.
pub type Callback = Box<dyn FnMut(Delivery) + Send + 'static>;

/// Runs once after the closed sentinel was delivered.
pub(crate) type CloseHook = Box<dyn FnOnce() + Send + 'static>;

/// Per-subscription parameters.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub lease: Lease,
    pub lease_config: LeaseConfig,
    /// Consecutive reads that complete no event before the stream is
    /// considered broken.
    pub max_framing_retries: u32,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            lease: Lease::Auto,
            lease_config: LeaseConfig::default(),
            max_framing_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl SubscribeOptions {
    /// Builder: set the lease.
    pub fn with_lease(mut self, lease: Lease) -> Self {
        self.lease = lease;
        self
    }

    /// Builder: set renewal parameters.
    pub fn with_lease_config(mut self, config: LeaseConfig) -> Self {
        self.lease_config = config;
        self
    }

    /// Builder: set the framing retry ceiling.
    pub fn with_max_framing_retries(mut self, retries: u32) -> Self {
        self.max_framing_retries = retries;
        self
    }

    /// Validates the options and returns the lease seconds to request.
    pub(crate) fn lease_seconds(&self) -> EventResult<u64> {
        if self.lease == Lease::Auto {
            self.lease_config.validate()?;
        }
        self.lease.seconds(&self.lease_config)
    }
}

/// State shared between a subscription and its background work.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) endpoint: Endpoint,
    last_renewal: Mutex<Instant>,
    stop: AtomicBool,
    closed: AtomicBool,
    renewal_failed: AtomicBool,
    /// Wakes an async reader when renewal fails.
    pub(crate) failure: Notify,
}

impl Shared {
    pub(crate) fn new(name: &str, endpoint: Endpoint) -> Self {
        Self {
            name: name.to_string(),
            endpoint,
            last_renewal: Mutex::new(Instant::now()),
            stop: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            renewal_failed: AtomicBool::new(false),
            failure: Notify::new(),
        }
    }

    pub(crate) fn renewed(&self) {
        *self.last_renewal.lock() = Instant::now();
    }

    pub(crate) fn since_renewal(&self) -> Duration {
        self.last_renewal.lock().elapsed()
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub(crate) fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_renewal(&self) {
        self.renewal_failed.store(true, Ordering::SeqCst);
        self.failure.notify_one();
    }

    pub(crate) fn renewal_failed(&self) -> bool {
        self.renewal_failed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Frame reassembly plus callback delivery for one subscription.
pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
    buffer: FrameBuffer,
    callback: Callback,
    on_close: Option<CloseHook>,
}

impl Dispatcher {
    pub(crate) fn new(
        shared: Arc<Shared>,
        max_retries: u32,
        callback: Callback,
        on_close: Option<CloseHook>,
    ) -> Self {
        Self {
            shared,
            buffer: FrameBuffer::with_max_retries(max_retries),
            callback,
            on_close,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Feeds one read and delivers every completed event.
    ///
    /// Returns false once the stream is unusable; the closed sentinel has
    /// then been delivered.
    pub(crate) fn feed(&mut self, data: &[u8]) -> bool {
        if let Err(e) = self.buffer.push(data) {
            warn!(event = %self.shared.name, error = %e, "Event stream desynchronized");
            self.close();
            return false;
        }
        while let Some(value) = self.buffer.pop() {
            (self.callback)(Delivery::Event(value));
        }
        true
    }

    /// Delivers the closed sentinel, once.
    pub(crate) fn close(&mut self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(event = %self.shared.name, "Subscription closed");
        (self.callback)(Delivery::Closed);
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

/// Sends `event_subscribe [event, endpoint, lease]` and checks for `"OK"`.
///
/// A lease of `0` cancels the subscription.
pub(crate) fn mi_subscribe(
    mi: &dyn MiExecutor,
    event: &str,
    endpoint: &Endpoint,
    lease: u64,
) -> EventResult<()> {
    let params = json!([event, endpoint.to_string(), lease]);
    let result = mi
        .execute(SUBSCRIBE_METHOD, Some(params))
        .map_err(|source| EventError::Mi {
            event: event.to_string(),
            source,
        })?;

    if result != "OK" {
        return Err(EventError::Subscription {
            event: event.to_string(),
            reason: format!("server replied {}", result),
        });
    }
    debug!(event, endpoint = %endpoint, lease, "event_subscribe acknowledged");
    Ok(())
}

/// An active subscription served by background threads.
pub struct Subscription {
    shared: Arc<Shared>,
    mi: Arc<dyn MiExecutor>,
    reader: Option<JoinHandle<Box<dyn Transport>>>,
    renewal: Option<(mpsc::Sender<()>, JoinHandle<()>)>,
    unsubscribed: bool,
}

impl Subscription {
    /// Binds `transport`, registers it for `event` and starts delivering.
    ///
    /// On failure the transport is destroyed before returning.
    pub fn subscribe<F>(
        event: &str,
        transport: Box<dyn Transport>,
        mi: Arc<dyn MiExecutor>,
        options: SubscribeOptions,
        callback: F,
    ) -> EventResult<Self>
    where
        F: FnMut(Delivery) + Send + 'static,
    {
        Self::start(event, transport, mi, options, Box::new(callback), None)
    }

    pub(crate) fn start(
        event: &str,
        mut transport: Box<dyn Transport>,
        mi: Arc<dyn MiExecutor>,
        options: SubscribeOptions,
        callback: Callback,
        on_close: Option<CloseHook>,
    ) -> EventResult<Self> {
        let lease_secs = options.lease_seconds()?;

        let endpoint = match transport.create() {
            Ok(endpoint) => endpoint,
            Err(e) => {
                transport.destroy();
                return Err(e);
            }
        };
        if let Err(e) = mi_subscribe(&*mi, event, &endpoint, lease_secs) {
            transport.destroy();
            return Err(e);
        }
        info!(event, endpoint = %endpoint, lease = lease_secs, "Subscribed");

        let shared = Arc::new(Shared::new(event, endpoint));
        let dispatcher = Dispatcher::new(
            shared.clone(),
            options.max_framing_retries,
            callback,
            on_close,
        );
        let lease = options.lease;
        let reader = thread::Builder::new()
            .name(format!("sipmi-event-{}", event))
            .spawn(move || read_loop(transport, dispatcher, lease));

        let mut subscription = Self {
            shared: shared.clone(),
            mi: mi.clone(),
            reader: None,
            renewal: None,
            unsubscribed: false,
        };
        match reader {
            Ok(handle) => subscription.reader = Some(handle),
            Err(e) => {
                // The transport went down with the closure.
                let _ = subscription.unsubscribe();
                return Err(EventError::transport("could not start event reader", e));
            }
        }

        if lease == Lease::Auto {
            let (stop_tx, stop_rx) = mpsc::channel();
            let config = options.lease_config.clone();
            let renewal = thread::Builder::new()
                .name(format!("sipmi-renew-{}", event))
                .spawn(move || renew_loop(shared, mi, config, lease_secs, stop_rx));
            match renewal {
                Ok(handle) => subscription.renewal = Some((stop_tx, handle)),
                Err(e) => {
                    let _ = subscription.unsubscribe();
                    return Err(EventError::transport("could not start lease renewal", e));
                }
            }
        }

        Ok(subscription)
    }

    /// Event name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Endpoint registered with the server.
    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    /// Returns true once the closed sentinel was delivered.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Stops lease renewal, cancels the subscription on the server, then
    /// stops the reader and destroys the transport.
    ///
    /// Local resources are released even when the server refuses the
    /// cancellation. A second call fails with
    /// [`EventError::AlreadyUnsubscribed`].
    pub fn unsubscribe(&mut self) -> EventResult<()> {
        if self.unsubscribed {
            return Err(EventError::AlreadyUnsubscribed(self.shared.name.clone()));
        }
        self.unsubscribed = true;

        self.stop_renewal();
        let result = mi_subscribe(&*self.mi, &self.shared.name, &self.shared.endpoint, 0);
        self.shutdown();
        match &result {
            Ok(()) => info!(event = %self.shared.name, "Unsubscribed"),
            Err(e) => warn!(event = %self.shared.name, error = %e, "Unsubscribe failed"),
        }
        result
    }

    /// Joins the renewer, so an in-flight renewal completes before anything
    /// else is sent.
    fn stop_renewal(&mut self) {
        if let Some((stop, handle)) = self.renewal.take() {
            drop(stop);
            if handle.join().is_err() {
                warn!(event = %self.shared.name, "Lease renewal thread panicked");
            }
        }
    }

    fn shutdown(&mut self) {
        self.stop_renewal();
        self.shared.request_stop();

        if let Some(reader) = self.reader.take() {
            // Called from the callback: the reader sees the stop flag and
            // destroys the transport when it exits.
            if reader.thread().id() == thread::current().id() {
                return;
            }
            match reader.join() {
                Ok(mut transport) => transport.destroy(),
                Err(_) => warn!(event = %self.shared.name, "Event reader thread panicked"),
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.shared.name)
            .field("endpoint", &self.shared.endpoint)
            .field("unsubscribed", &self.unsubscribed)
            .finish_non_exhaustive()
    }
}

fn read_loop(
    mut transport: Box<dyn Transport>,
    mut dispatcher: Dispatcher,
    lease: Lease,
) -> Box<dyn Transport> {
    let shared = dispatcher.shared().clone();

    while !shared.stopping() {
        if shared.renewal_failed() {
            dispatcher.close();
            break;
        }
        if let Lease::Fixed(duration) = lease
            && shared.since_renewal() > duration
        {
            info!(event = %shared.name, "Lease expired");
            dispatcher.close();
            break;
        }

        match transport.read() {
            Ok(Some(data)) => {
                debug!(event = %shared.name, bytes = data.len(), "Event data received");
                if !dispatcher.feed(&data) {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(event = %shared.name, error = %e, "Event read failed");
                dispatcher.close();
                break;
            }
        }
    }

    transport
}

fn renew_loop(
    shared: Arc<Shared>,
    mi: Arc<dyn MiExecutor>,
    config: LeaseConfig,
    lease_secs: u64,
    stop: mpsc::Receiver<()>,
) {
    loop {
        match stop.recv_timeout(config.next_renewal_delay()) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }

        match mi_subscribe(&*mi, &shared.name, &shared.endpoint, lease_secs) {
            Ok(()) => {
                shared.renewed();
                info!(event = %shared.name, lease = lease_secs, "Subscription renewed");
            }
            Err(e) => {
                warn!(event = %shared.name, error = %e, "Lease renewal failed");
                shared.fail_renewal();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeMi, fake_transport};
    use crate::transport::TransportConfig;
    use sipmi_mi::{MiError, TransportError};
    use std::io::Write;
    use std::net::TcpStream;
    use std::sync::mpsc::Receiver;

    const WAIT: Duration = Duration::from_secs(3);

    fn collector() -> (impl FnMut(Delivery) + Send + 'static, Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel();
        (move |d| drop(tx.send(d)), rx)
    }

    #[test]
    fn delivers_events_split_across_reads() {
        let mi = FakeMi::new();
        let (transport, handle) = fake_transport();
        let (callback, rx) = collector();

        let mut sub = Subscription::subscribe(
            "E_UL_AOR_INSERT",
            transport,
            mi.clone(),
            SubscribeOptions::default(),
            callback,
        )
        .unwrap();

        handle.feed(br#"{"event":"a"}{"ev"#);
        handle.feed(br#"ent":"b"}"#);
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Delivery::Event(json!({"event": "a"})));
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Delivery::Event(json!({"event": "b"})));

        let calls = mi.calls();
        assert_eq!(calls[0].0, SUBSCRIBE_METHOD);
        assert_eq!(calls[0].1, json!(["E_UL_AOR_INSERT", "udp:127.0.0.1:9999", 3600]));

        sub.unsubscribe().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn delivers_events_over_stream_transport() {
        let mi = FakeMi::new();
        let (callback, rx) = collector();
        let transport = TransportConfig::stream("127.0.0.1", 0).build().unwrap();
        let mut sub = Subscription::subscribe(
            "E_UL_CONTACT_UPDATE",
            transport,
            mi.clone(),
            SubscribeOptions::default(),
            callback,
        )
        .unwrap();
        let Endpoint::Tcp(addr) = sub.endpoint().clone() else {
            panic!("unexpected endpoint {:?}", sub.endpoint());
        };
        assert_eq!(mi.endpoint(), Some(format!("tcp:127.0.0.1:{}", addr.port())));

        let mut conn = TcpStream::connect(addr).unwrap();
        conn.write_all(br#"{"event":"a"}{"event":"#).unwrap();
        thread::sleep(Duration::from_millis(30));
        conn.write_all(br#""b"}"#).unwrap();
        drop(conn);

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Delivery::Event(json!({"event": "a"})));
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Delivery::Event(json!({"event": "b"})));

        sub.unsubscribe().unwrap();
        assert_eq!(mi.leases(), vec![3600, 0]);
        assert!(TcpStream::connect(addr).is_err());
    }

    #[test]
    fn unsubscribe_lets_renewal_finish_before_cancelling() {
        let mi = FakeMi::slow(Duration::from_millis(150));
        let (transport, handle) = fake_transport();
        let options = SubscribeOptions::default().with_lease_config(LeaseConfig::new(
            Duration::from_secs(2),
            Duration::from_millis(1900),
        ));
        let mut sub = Subscription::subscribe("E_X", transport, mi.clone(), options, |_| {}).unwrap();

        thread::sleep(Duration::from_millis(80));
        sub.unsubscribe().unwrap();
        thread::sleep(Duration::from_millis(400));

        let leases = mi.leases();
        assert_eq!(leases.last(), Some(&0), "leases: {leases:?}");
        assert!(leases[..leases.len() - 1].iter().all(|&l| l == 2), "leases: {leases:?}");
        assert_eq!(handle.destroyed(), 1);
    }

    #[test]
    fn refused_subscribe_destroys_transport() {
        let mi = FakeMi::new();
        mi.reply(Ok(json!("FAIL")));
        let (transport, handle) = fake_transport();

        let err = Subscription::subscribe("E_X", transport, mi, SubscribeOptions::default(), |_| {})
            .unwrap_err();
        assert!(matches!(err, EventError::Subscription { .. }));
        assert_eq!(handle.destroyed(), 1);
    }

    #[test]
    fn failed_subscribe_command_destroys_transport() {
        let mi = FakeMi::new();
        mi.reply(Err(MiError::from(TransportError::Unavailable("down".into()))));
        let (transport, handle) = fake_transport();

        let err = Subscription::subscribe("E_X", transport, mi, SubscribeOptions::default(), |_| {})
            .unwrap_err();
        assert!(matches!(err, EventError::Mi { .. }));
        assert!(err.is_subscription());
        assert_eq!(handle.destroyed(), 1);
    }

    #[test]
    fn zero_lease_is_rejected_before_binding() {
        let mi = FakeMi::new();
        let (transport, handle) = fake_transport();
        let options = SubscribeOptions::default().with_lease(Lease::Fixed(Duration::ZERO));

        let err = Subscription::subscribe("E_X", transport, mi.clone(), options, |_| {}).unwrap_err();
        assert!(matches!(err, EventError::InvalidConfig(_)));
        assert!(!handle.created());
        assert!(mi.calls().is_empty());
    }

    #[test]
    fn unsubscribe_twice_is_a_usage_error() {
        let mi = FakeMi::new();
        let (transport, handle) = fake_transport();
        let mut sub =
            Subscription::subscribe("E_X", transport, mi.clone(), SubscribeOptions::default(), |_| {})
                .unwrap();

        sub.unsubscribe().unwrap();
        assert!(matches!(sub.unsubscribe(), Err(EventError::AlreadyUnsubscribed(_))));
        assert_eq!(handle.destroyed(), 1);
        assert_eq!(mi.leases(), vec![3600, 0]);

        drop(sub);
        assert_eq!(handle.destroyed(), 1);
    }

    #[test]
    fn refused_unsubscribe_still_releases_transport() {
        let mi = FakeMi::new();
        mi.reply(Ok(json!("OK")));
        mi.reply(Ok(json!("FAIL")));
        let (transport, handle) = fake_transport();
        let mut sub =
            Subscription::subscribe("E_X", transport, mi, SubscribeOptions::default(), |_| {}).unwrap();

        assert!(matches!(sub.unsubscribe(), Err(EventError::Subscription { .. })));
        assert_eq!(handle.destroyed(), 1);
    }

    #[test]
    fn framing_failure_delivers_closed() {
        let mi = FakeMi::new();
        let (transport, handle) = fake_transport();
        let (callback, rx) = collector();
        let options = SubscribeOptions::default().with_max_framing_retries(2);
        let sub = Subscription::subscribe("E_X", transport, mi, options, callback).unwrap();

        handle.feed(br#"{"a":["#);
        handle.feed(b"1,");
        handle.feed(b"2,");
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Delivery::Closed);
        assert!(sub.is_closed());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn fixed_lease_expires_without_renewal() {
        let mi = FakeMi::new();
        let (transport, _handle) = fake_transport();
        let (callback, rx) = collector();
        let options = SubscribeOptions::default().with_lease(Lease::Fixed(Duration::from_millis(200)));
        let _sub = Subscription::subscribe("E_X", transport, mi.clone(), options, callback).unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Delivery::Closed);
        assert_eq!(mi.leases(), vec![1]);
    }

    #[test]
    fn automatic_lease_is_renewed() {
        let mi = FakeMi::new();
        let (transport, _handle) = fake_transport();
        let options = SubscribeOptions::default().with_lease_config(LeaseConfig::new(
            Duration::from_secs(2),
            Duration::from_millis(1900),
        ));
        let mut sub = Subscription::subscribe("E_X", transport, mi.clone(), options, |_| {}).unwrap();

        thread::sleep(Duration::from_millis(450));
        sub.unsubscribe().unwrap();

        let leases = mi.leases();
        assert!(leases.len() >= 3, "leases: {leases:?}");
        assert!(leases[..leases.len() - 1].iter().all(|&l| l == 2));
        assert_eq!(leases.last(), Some(&0));
    }

    #[test]
    fn renewal_failure_delivers_closed() {
        let mi = FakeMi::new();
        mi.reply(Ok(json!("OK")));
        mi.reply(Err(MiError::from(TransportError::timeout("reading reply FIFO"))));
        let (transport, _handle) = fake_transport();
        let (callback, rx) = collector();
        let options = SubscribeOptions::default().with_lease_config(LeaseConfig::new(
            Duration::from_secs(2),
            Duration::from_millis(1900),
        ));
        let _sub = Subscription::subscribe("E_X", transport, mi, options, callback).unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Delivery::Closed);
    }

    #[test]
    fn unsubscribe_from_callback_does_not_deadlock() {
        let mi = FakeMi::new();
        let (transport, handle) = fake_transport();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let (done_tx, done_rx) = mpsc::channel();

        let callback_slot = slot.clone();
        let sub = Subscription::subscribe(
            "E_X",
            transport,
            mi.clone(),
            SubscribeOptions::default(),
            move |_| {
                if let Some(mut sub) = callback_slot.lock().take() {
                    let _ = done_tx.send(sub.unsubscribe().is_ok());
                }
            },
        )
        .unwrap();
        *slot.lock() = Some(sub);

        handle.feed(b"{}");
        assert!(done_rx.recv_timeout(WAIT).unwrap());

        let deadline = Instant::now() + WAIT;
        while handle.destroyed() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handle.destroyed(), 1);
        assert_eq!(mi.leases(), vec![3600, 0]);
    }
}
