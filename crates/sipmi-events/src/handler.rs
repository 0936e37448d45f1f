//! Registry of active subscriptions, keyed by event name.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use sipmi_mi::MiExecutor;

use crate::async_subscription::AsyncSubscription;
use crate::error::{EventError, EventResult};
use crate::subscription::{CloseHook, Delivery, SubscribeOptions, Subscription};
use crate::transport::TransportConfig;

enum Active {
    Threaded(Subscription),
    Async(AsyncSubscription),
}

impl Active {
    fn is_closed(&self) -> bool {
        match self {
            Self::Threaded(sub) => sub.is_closed(),
            Self::Async(sub) => sub.is_closed(),
        }
    }
}

type Registry = Arc<Mutex<HashMap<String, Active>>>;

/// Creates one transport per subscription and tracks subscriptions by
/// event name.
///
/// A subscription that ends on its own (closed sentinel) leaves the
/// registry by itself.
pub struct EventHandler {
    mi: Arc<dyn MiExecutor>,
    transport: TransportConfig,
    registry: Registry,
}

impl EventHandler {
    /// Creates a handler. Fails on an invalid transport configuration
    /// before any socket is created.
    pub fn new(mi: Arc<dyn MiExecutor>, transport: TransportConfig) -> EventResult<Self> {
        transport.validate()?;
        Ok(Self {
            mi,
            transport,
            registry: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Transport parameters used for new subscriptions.
    pub fn transport_config(&self) -> &TransportConfig {
        &self.transport
    }

    /// Subscribes to `event`, delivering on a background thread.
    pub fn subscribe<F>(&self, event: &str, options: SubscribeOptions, callback: F) -> EventResult<()>
    where
        F: FnMut(Delivery) + Send + 'static,
    {
        self.ensure_free(event)?;
        let transport = self.transport.build()?;
        let sub = Subscription::start(
            event,
            transport,
            self.mi.clone(),
            options,
            Box::new(callback),
            Some(self.close_hook(event)),
        )?;

        match self.register(event, Active::Threaded(sub)) {
            Ok(()) => Ok(()),
            Err(Active::Threaded(mut sub)) if !sub.is_closed() => {
                let _ = sub.unsubscribe();
                Err(EventError::AlreadySubscribed(event.to_string()))
            }
            // Ended before it could be registered; the callback already saw
            // the closed sentinel.
            Err(_) => Ok(()),
        }
    }

    /// Subscribes to `event`, delivering from the current tokio runtime.
    pub async fn subscribe_async<F>(
        &self,
        event: &str,
        options: SubscribeOptions,
        callback: F,
    ) -> EventResult<()>
    where
        F: FnMut(Delivery) + Send + 'static,
    {
        self.ensure_free(event)?;
        let transport = self.transport.build()?;
        let sub = AsyncSubscription::start(
            event,
            transport,
            self.mi.clone(),
            options,
            Box::new(callback),
            Some(self.close_hook(event)),
        )
        .await?;

        match self.register(event, Active::Async(sub)) {
            Ok(()) => Ok(()),
            Err(Active::Async(mut sub)) if !sub.is_closed() => {
                let _ = sub.unsubscribe().await;
                Err(EventError::AlreadySubscribed(event.to_string()))
            }
            Err(_) => Ok(()),
        }
    }

    /// Cancels a subscription made with [`subscribe`](Self::subscribe).
    ///
    /// Async subscriptions must go through
    /// [`unsubscribe_async`](Self::unsubscribe_async).
    pub fn unsubscribe(&self, event: &str) -> EventResult<()> {
        let active = self.take(event)?;
        match active {
            Active::Threaded(mut sub) => sub.unsubscribe(),
            async_sub @ Active::Async(_) => {
                self.registry.lock().insert(event.to_string(), async_sub);
                Err(EventError::WrongRuntime(format!(
                    "event {} was subscribed asynchronously; use unsubscribe_async",
                    event
                )))
            }
        }
    }

    /// Cancels a subscription of either kind.
    pub async fn unsubscribe_async(&self, event: &str) -> EventResult<()> {
        match self.take(event)? {
            Active::Async(mut sub) => sub.unsubscribe().await,
            Active::Threaded(mut sub) => tokio::task::spawn_blocking(move || sub.unsubscribe())
                .await
                .map_err(|e| EventError::transport("unsubscribe task failed", std::io::Error::other(e)))?,
        }
    }

    /// Returns true if `event` has a live subscription.
    pub fn is_subscribed(&self, event: &str) -> bool {
        self.registry
            .lock()
            .get(event)
            .is_some_and(|active| !active.is_closed())
    }

    /// Names of the live subscriptions, sorted.
    pub fn events(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .registry
            .lock()
            .iter()
            .filter(|(_, active)| !active.is_closed())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Cancels every subscription. Keeps going on failure and returns the
    /// first error.
    pub async fn unsubscribe_all(&self) -> EventResult<()> {
        let names: Vec<String> = self.registry.lock().keys().cloned().collect();
        let mut first_error = None;
        for name in names {
            match self.unsubscribe_async(&name).await {
                Ok(()) | Err(EventError::NotSubscribed(_)) => {}
                Err(e) => {
                    warn!(event = %name, error = %e, "Failed to unsubscribe");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn ensure_free(&self, event: &str) -> EventResult<()> {
        if event.is_empty() {
            return Err(EventError::config("event name is required"));
        }
        let stale = {
            let mut registry = self.registry.lock();
            match registry.get(event) {
                Some(active) if !active.is_closed() => {
                    return Err(EventError::AlreadySubscribed(event.to_string()));
                }
                Some(_) => registry.remove(event),
                None => None,
            }
        };
        drop(stale);
        Ok(())
    }

    fn take(&self, event: &str) -> EventResult<Active> {
        self.registry
            .lock()
            .remove(event)
            .ok_or_else(|| EventError::NotSubscribed(event.to_string()))
    }

    /// Inserts `active` unless the name is taken or it already ended.
    ///
    /// Rejected subscriptions are handed back so they are dropped outside
    /// the lock: dropping one joins its reader, which may be waiting on
    /// this lock in its close hook.
    fn register(&self, event: &str, active: Active) -> Result<(), Active> {
        let mut registry = self.registry.lock();
        let occupied = registry.get(event).is_some_and(|current| !current.is_closed());
        if occupied || active.is_closed() {
            return Err(active);
        }
        let replaced = registry.insert(event.to_string(), active);
        drop(registry);
        drop(replaced);
        debug!(event, "Subscription registered");
        Ok(())
    }

    fn close_hook(&self, event: &str) -> CloseHook {
        let registry: Weak<Mutex<HashMap<String, Active>>> = Arc::downgrade(&self.registry);
        let event = event.to_string();
        Box::new(move || {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let removed = {
                let mut registry = registry.lock();
                if registry.get(&event).is_some_and(Active::is_closed) {
                    registry.remove(&event)
                } else {
                    None
                }
            };
            if removed.is_some() {
                debug!(event = %event, "Closed subscription removed");
            }
            drop(removed);
        })
    }
}

impl std::fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandler")
            .field("transport", &self.transport)
            .field("events", &self.events())
            .finish_non_exhaustive()
    }
}
