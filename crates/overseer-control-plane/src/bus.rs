//! In-process publish/subscribe event bus.
//!
//! Delivery is synchronous and in subscription order. Every handler runs
//! inside its own panic boundary, so one failing subscriber neither blocks
//! the remaining subscribers nor unwinds into the publisher. No lock is held
//! while handlers run; handlers may publish or (un)subscribe re-entrantly.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use overseer_core::{Event, EventName, EventPayload};

use crate::error::BusError;

/// Subscriber callback.
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    handler: Handler,
    once: bool,
}

/// Point-in-time bus counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: BTreeMap<EventName, u64>,
    pub subscribers: BTreeMap<EventName, usize>,
}

/// Process-wide event bus. Construct once and share via `Arc`.
#[derive(Default)]
pub struct EventBus {
    subscriptions: RwLock<HashMap<EventName, Vec<Subscription>>>,
    published: Mutex<HashMap<EventName, u64>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `name`.
    pub fn subscribe<F>(&self, name: EventName, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(name, Arc::new(handler), false)
    }

    /// Register a handler that is removed after its first delivery.
    pub fn subscribe_once<F>(&self, name: EventName, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(name, Arc::new(handler), true)
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, name: EventName, id: SubscriptionId) -> bool {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let Some(list) = subscriptions.get_mut(&name) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        before != list.len()
    }

    /// Publish an event. Returns true if at least one subscriber existed.
    pub fn publish(&self, name: EventName, payload: EventPayload) -> bool {
        self.publish_event(Event::new(name, payload))
    }

    /// Publish a pre-built event.
    pub fn publish_event(&self, event: Event) -> bool {
        let name = event.name;
        *self
            .published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name)
            .or_insert(0) += 1;

        let handlers: Vec<Handler> = {
            let mut subscriptions = self
                .subscriptions
                .write()
                .unwrap_or_else(|e| e.into_inner());
            let Some(list) = subscriptions.get_mut(&name) else {
                return false;
            };
            let handlers = list.iter().map(|s| s.handler.clone()).collect();
            // One-shot subscribers leave before dispatch so a re-entrant
            // publish cannot deliver to them twice.
            list.retain(|s| !s.once);
            handlers
        };

        if handlers.is_empty() {
            return false;
        }

        for handler in &handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                error!(
                    event = %name,
                    panic = %panic_message(panic.as_ref()),
                    "Event subscriber panicked"
                );
            }
        }

        true
    }

    /// Resolve with the next `name` event, or fail after `timeout`.
    ///
    /// The subscription is registered when this is called, not when the
    /// future is first polled, so an event published in between is not lost.
    pub fn wait_for(
        &self,
        name: EventName,
        timeout: Duration,
    ) -> impl Future<Output = Result<Event, BusError>> + '_ {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let id = self.subscribe_once(name, move |event| {
            if let Some(tx) = tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
                let _ = tx.send(event.clone());
            }
        });

        async move {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(event)) => Ok(event),
                Ok(Err(_)) => Err(BusError::Closed(name)),
                Err(_) => {
                    self.unsubscribe(name, id);
                    Err(BusError::Timeout { name, timeout })
                }
            }
        }
    }

    /// Number of times `name` has been published.
    pub fn publish_count(&self, name: EventName) -> u64 {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&name)
            .copied()
            .unwrap_or(0)
    }

    /// Number of active subscriptions for `name`.
    pub fn subscriber_count(&self, name: EventName) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&name)
            .map_or(0, Vec::len)
    }

    pub fn stats(&self) -> BusStats {
        let published = self
            .published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, count)| (*name, *count))
            .collect();
        let subscribers = self
            .subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(name, list)| (*name, list.len()))
            .collect();
        BusStats {
            published,
            subscribers,
        }
    }

    fn register(&self, name: EventName, handler: Handler, once: bool) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name)
            .or_default()
            .push(Subscription { id, handler, once });
        id
    }
}

/// Log every catalog event through `tracing`.
pub fn attach_event_log(bus: &EventBus) -> Vec<SubscriptionId> {
    EventName::ALL
        .into_iter()
        .map(|name| {
            bus.subscribe(name, move |event| match event.name {
                EventName::SystemError | EventName::AgentStuck | EventName::TaskFailed => {
                    warn!(event = %event.name, payload = ?event.payload, "bus event");
                }
                _ => debug!(event = %event.name, payload = ?event.payload, "bus event"),
            })
        })
        .collect()
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
