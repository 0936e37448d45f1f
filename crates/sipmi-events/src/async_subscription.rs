//! Event subscriptions driven by the tokio reactor.
//!
//! The transport is switched to non-blocking mode and its descriptor is
//! registered with [`AsyncFd`]; reads happen only when the socket is
//! readable. Lease renewal is a separate task. MI commands block, so they
//! run on the blocking pool.

use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sipmi_mi::MiExecutor;

use crate::error::{EventError, EventResult};
use crate::lease::{Lease, LeaseConfig};
use crate::subscription::{
    Callback, CloseHook, Delivery, Dispatcher, Shared, SubscribeOptions, mi_subscribe,
};
use crate::transport::{Endpoint, Transport};

/// How often a transport with half-read input is read again.
const PENDING_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Borrowed descriptor registered with the reactor. The transport keeps
/// ownership and outlives the registration.
struct ReadinessFd(RawFd);

impl AsRawFd for ReadinessFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// An active subscription served by tokio tasks.
pub struct AsyncSubscription {
    shared: Arc<Shared>,
    mi: Arc<dyn MiExecutor>,
    stop: watch::Sender<bool>,
    reader: Option<JoinHandle<Box<dyn Transport>>>,
    renewal: Option<(oneshot::Sender<()>, JoinHandle<()>)>,
    unsubscribed: bool,
}

impl AsyncSubscription {
    /// Binds `transport`, registers it for `event` and starts delivering.
    ///
    /// Must be called from within a tokio runtime. On failure the
    /// transport is destroyed before returning.
    pub async fn subscribe<F>(
        event: &str,
        transport: Box<dyn Transport>,
        mi: Arc<dyn MiExecutor>,
        options: SubscribeOptions,
        callback: F,
    ) -> EventResult<Self>
    where
        F: FnMut(Delivery) + Send + 'static,
    {
        Self::start(event, transport, mi, options, Box::new(callback), None).await
    }

    pub(crate) async fn start(
        event: &str,
        mut transport: Box<dyn Transport>,
        mi: Arc<dyn MiExecutor>,
        options: SubscribeOptions,
        callback: Callback,
        on_close: Option<CloseHook>,
    ) -> EventResult<Self> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(EventError::WrongRuntime(
                "async subscriptions need a tokio runtime".to_string(),
            ));
        }
        let lease_secs = options.lease_seconds()?;

        let bound = transport
            .create()
            .and_then(|endpoint| Ok((endpoint, pollable(&mut *transport)?)));
        let (endpoint, fd) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                transport.destroy();
                return Err(e);
            }
        };

        let registered = {
            let mi = mi.clone();
            let event = event.to_string();
            let endpoint = endpoint.clone();
            run_blocking(move || mi_subscribe(&*mi, &event, &endpoint, lease_secs)).await
        };
        if let Err(e) = registered {
            transport.destroy();
            return Err(e);
        }
        info!(event, endpoint = %endpoint, lease = lease_secs, "Subscribed");

        let shared = Arc::new(Shared::new(event, endpoint));
        let (stop_tx, stop_rx) = watch::channel(false);
        let dispatcher = Dispatcher::new(
            shared.clone(),
            options.max_framing_retries,
            callback,
            on_close,
        );

        let reader = tokio::spawn(read_events(transport, fd, dispatcher, options.lease, stop_rx));
        let renewal = (options.lease == Lease::Auto).then(|| {
            let (renew_tx, renew_rx) = oneshot::channel();
            let handle = tokio::spawn(renew(
                shared.clone(),
                mi.clone(),
                options.lease_config.clone(),
                lease_secs,
                renew_rx,
            ));
            (renew_tx, handle)
        });

        Ok(Self {
            shared,
            mi,
            stop: stop_tx,
            reader: Some(reader),
            renewal,
            unsubscribed: false,
        })
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
    pub async fn unsubscribe(&mut self) -> EventResult<()> {
        if self.unsubscribed {
            return Err(EventError::AlreadyUnsubscribed(self.shared.name.clone()));
        }
        self.unsubscribed = true;

        self.stop_renewal().await;
        let result = {
            let mi = self.mi.clone();
            let shared = self.shared.clone();
            run_blocking(move || mi_subscribe(&*mi, &shared.name, &shared.endpoint, 0)).await
        };
        self.shutdown().await;
        match &result {
            Ok(()) => info!(event = %self.shared.name, "Unsubscribed"),
            Err(e) => warn!(event = %self.shared.name, error = %e, "Unsubscribe failed"),
        }
        result
    }

    /// Waits out an in-flight renewal so none reaches the server later.
    async fn stop_renewal(&mut self) {
        if let Some((stop, handle)) = self.renewal.take() {
            drop(stop);
            if let Err(e) = handle.await
                && e.is_panic()
            {
                warn!(event = %self.shared.name, "Lease renewal task panicked");
            }
        }
    }

    async fn shutdown(&mut self) {
        self.stop_renewal().await;
        self.shared.request_stop();
        let _ = self.stop.send(true);

        if let Some(reader) = self.reader.take() {
            match reader.await {
                Ok(mut transport) => transport.destroy(),
                Err(e) if e.is_cancelled() => {}
                Err(_) => warn!(event = %self.shared.name, "Event reader task panicked"),
            }
        }
    }
}

impl Drop for AsyncSubscription {
    fn drop(&mut self) {
        self.shared.request_stop();
        let _ = self.stop.send(true);
        if let Some((_, renewal)) = self.renewal.take() {
            renewal.abort();
        }
        // An aborted reader drops, and so destroys, its transport.
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl std::fmt::Debug for AsyncSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSubscription")
            .field("name", &self.shared.name)
            .field("endpoint", &self.shared.endpoint)
            .field("unsubscribed", &self.unsubscribed)
            .finish_non_exhaustive()
    }
}

fn pollable(transport: &mut dyn Transport) -> EventResult<RawFd> {
    transport.set_nonblocking(true)?;
    transport
        .as_raw_fd()
        .ok_or_else(|| EventError::config("transport has no pollable descriptor"))
}

async fn run_blocking<F>(f: F) -> EventResult<()>
where
    F: FnOnce() -> EventResult<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EventError::transport("MI task failed", std::io::Error::other(e)))?
}

async fn read_events(
    mut transport: Box<dyn Transport>,
    fd: RawFd,
    mut dispatcher: Dispatcher,
    lease: Lease,
    mut stop: watch::Receiver<bool>,
) -> Box<dyn Transport> {
    let shared = dispatcher.shared().clone();
    let async_fd = match AsyncFd::with_interest(ReadinessFd(fd), Interest::READABLE) {
        Ok(async_fd) => async_fd,
        Err(e) => {
            warn!(event = %shared.name, error = %e, "Could not register event socket");
            dispatcher.close();
            return transport;
        }
    };

    let expiry = async {
        match lease {
            Lease::Fixed(duration) => tokio::time::sleep(duration).await,
            Lease::Auto => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(expiry);

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = shared.failure.notified() => {
                dispatcher.close();
                break;
            }
            _ = &mut expiry => {
                info!(event = %shared.name, "Lease expired");
                dispatcher.close();
                break;
            }
            ready = async_fd.readable() => {
                let mut guard = match ready {
                    Ok(guard) => guard,
                    Err(e) => {
                        warn!(event = %shared.name, error = %e, "Event socket poll failed");
                        dispatcher.close();
                        break;
                    }
                };

                // Readiness is edge-triggered: drain until the socket is empty.
                match drain(&mut *transport, &mut dispatcher) {
                    Drained::Empty => guard.clear_ready(),
                    Drained::Closed => break,
                }
            }
            _ = tokio::time::sleep(PENDING_POLL_INTERVAL), if transport.has_pending() => {
                if let Drained::Closed = drain(&mut *transport, &mut dispatcher) {
                    break;
                }
            }
        }
    }

    drop(async_fd);
    transport
}

enum Drained {
    /// The transport has nothing more to give.
    Empty,
    /// The closed sentinel was delivered.
    Closed,
}

fn drain(transport: &mut dyn Transport, dispatcher: &mut Dispatcher) -> Drained {
    loop {
        match transport.read() {
            Ok(Some(data)) => {
                debug!(event = %dispatcher.shared().name, bytes = data.len(), "Event data received");
                if !dispatcher.feed(&data) {
                    return Drained::Closed;
                }
            }
            Ok(None) => return Drained::Empty,
            Err(e) => {
                warn!(event = %dispatcher.shared().name, error = %e, "Event read failed");
                dispatcher.close();
                return Drained::Closed;
            }
        }
    }
}

async fn renew(
    shared: Arc<Shared>,
    mi: Arc<dyn MiExecutor>,
    config: LeaseConfig,
    lease_secs: u64,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop => return,
            _ = tokio::time::sleep(config.next_renewal_delay()) => {}
        }

        let result = {
            let mi = mi.clone();
            let shared = shared.clone();
            run_blocking(move || mi_subscribe(&*mi, &shared.name, &shared.endpoint, lease_secs)).await
        };
        match result {
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
