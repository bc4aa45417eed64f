//! EventBus - typed pub/sub with per-subscriber ordered delivery
//!
//! Every subscription owns an unbounded queue drained by its own task, so a
//! slow or failing handler never holds up the publisher or other subscribers.
//! Events from one publisher reach a subscriber in publish order.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use journalstore::Journal;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info, warn};

use super::types::{Event, WILDCARD};
use crate::config::BusConfig;
use crate::error::{DeliveryError, ValidationError};

/// Journal stream receiving every accepted event
pub const EVENTS_STREAM: &str = "_events";

/// Something that processes delivered events
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: Arc<Event>) -> eyre::Result<()>;
}

/// Adapter turning an async closure into an [`EventHandler`]
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: Arc<Event>) -> eyre::Result<()> {
        (self.0)(event).await
    }
}

/// Wrap an async closure as a shareable handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Publishing half of the bus
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: Event) -> Result<(), ValidationError>;
}

/// Subscribing half of the bus
pub trait EventSubscriber: Send + Sync {
    fn subscribe_handler(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> SubscriptionHandle;
    fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool;
}

/// Identifies one subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    event_type: String,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }
}

struct Subscriber {
    handle: SubscriptionHandle,
    tx: mpsc::UnboundedSender<Arc<Event>>,
}

/// Running counters, shared with delivery tasks
#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    rejected: AtomicU64,
    handler_failures: AtomicU64,
    redeliveries: AtomicU64,
    dead_letters: AtomicU64,
}

/// State shared between the bus and its delivery tasks
#[derive(Debug, Default)]
struct Shared {
    counters: Counters,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Shared {
    fn finish_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Redelivery {
    max_redeliveries: u32,
    backoff: Duration,
}

/// Snapshot of bus activity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub rejected: u64,
    pub handler_failures: u64,
    pub redeliveries: u64,
    pub dead_letters: u64,
    pub subscriptions: usize,
    pub in_flight: usize,
    pub event_types: BTreeMap<String, u64>,
}

/// In-process event bus
pub struct EventBus {
    subscriptions: RwLock<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
    shared: Arc<Shared>,
    redelivery: Redelivery,
    history: Mutex<VecDeque<Arc<Event>>>,
    history_capacity: usize,
    type_counts: Mutex<BTreeMap<String, u64>>,
    journal: Option<Arc<Journal>>,
}

impl EventBus {
    /// Create a bus that keeps accepted events in memory only
    pub fn new(config: &BusConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a bus that also journals accepted events
    pub fn with_journal(config: &BusConfig, journal: Arc<Journal>) -> Self {
        Self::build(config, Some(journal))
    }

    fn build(config: &BusConfig, journal: Option<Arc<Journal>>) -> Self {
        debug!(?config, persistent = journal.is_some(), "EventBus::new: called");
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            shared: Arc::new(Shared::default()),
            redelivery: Redelivery {
                max_redeliveries: config.max_redeliveries,
                backoff: Duration::from_millis(config.redelivery_backoff_ms),
            },
            history: Mutex::new(VecDeque::new()),
            history_capacity: config.history_capacity,
            type_counts: Mutex::new(BTreeMap::new()),
            journal,
        }
    }

    /// Validate and enqueue an event for every matching subscriber
    ///
    /// Returns once the event is queued. Malformed events are rejected and
    /// reach nobody.
    pub fn publish(&self, event: Event) -> Result<(), ValidationError> {
        let kind = match event.validate() {
            Ok(kind) => kind,
            Err(e) => {
                self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(event_type = %event.event_type, source = %event.source, error = %e, "EventBus::publish: rejected");
                return Err(e);
            }
        };
        debug!(event_type = %event.event_type, source = %event.source, event_id = %event.id, ?kind, "EventBus::publish: called");

        let event = Arc::new(event);
        self.remember(&event);

        if let Some(journal) = &self.journal
            && let Err(e) = journal.append(EVENTS_STREAM, event.as_ref())
        {
            warn!(event_id = %event.id, error = %e, "EventBus::publish: failed to journal event");
        }

        self.shared.counters.published.fetch_add(1, Ordering::Relaxed);

        let targets: Vec<mpsc::UnboundedSender<Arc<Event>>> = match self.subscriptions.read() {
            Ok(subs) => [event.event_type.as_str(), WILDCARD]
                .iter()
                .filter_map(|key| subs.get(*key))
                .flatten()
                .map(|sub| sub.tx.clone())
                .collect(),
            Err(_) => {
                error!("EventBus::publish: subscription table poisoned");
                Vec::new()
            }
        };

        for tx in targets {
            self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
            if tx.send(event.clone()).is_err() {
                // Delivery task already gone
                self.shared.finish_one();
            }
        }

        Ok(())
    }

    /// Subscribe an async closure to an event type (`*` for all)
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe<F, Fut>(&self, event_type: &str, handler: F) -> SubscriptionHandle
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<()>> + Send + 'static,
    {
        self.subscribe_handler(event_type, handler_fn(handler))
    }

    /// Subscribe a handler to an event type (`*` for all)
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe_handler(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = SubscriptionHandle {
            id,
            event_type: event_type.to_string(),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(deliver(rx, handler, id, self.shared.clone(), self.redelivery));

        match self.subscriptions.write() {
            Ok(mut subs) => subs.entry(event_type.to_string()).or_default().push(Subscriber {
                handle: handle.clone(),
                tx,
            }),
            Err(_) => error!("EventBus::subscribe: subscription table poisoned"),
        }

        debug!(subscription = id, %event_type, "EventBus::subscribe: registered");
        handle
    }

    /// Remove a subscription; events already queued for it are still delivered
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let Ok(mut subs) = self.subscriptions.write() else {
            error!("EventBus::unsubscribe: subscription table poisoned");
            return false;
        };
        let Some(list) = subs.get_mut(&handle.event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|sub| sub.handle.id != handle.id);
        let removed = list.len() != before;
        if list.is_empty() {
            subs.remove(&handle.event_type);
        }
        debug!(subscription = handle.id, removed, "EventBus::unsubscribe: called");
        removed
    }

    /// Wait until every queued delivery has been handled
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.shared.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Number of active subscriptions
    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .read()
            .map(|subs| subs.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Event types that currently have subscribers
    pub fn subscribed_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .subscriptions
            .read()
            .map(|subs| subs.keys().cloned().collect())
            .unwrap_or_default();
        types.sort();
        types
    }

    /// Count of accepted events per type
    pub fn event_types(&self) -> BTreeMap<String, u64> {
        self.type_counts.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Most recent accepted events, oldest first
    pub fn recent(&self, event_type: Option<&str>, limit: usize) -> Vec<Event> {
        let Ok(history) = self.history.lock() else {
            return Vec::new();
        };
        let mut events: Vec<Event> = history
            .iter()
            .rev()
            .filter(|e| event_type.is_none_or(|t| e.event_type == t))
            .take(limit)
            .map(|e| e.as_ref().clone())
            .collect();
        events.reverse();
        events
    }

    /// Current counters
    pub fn stats(&self) -> BusStats {
        let c = &self.shared.counters;
        BusStats {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            handler_failures: c.handler_failures.load(Ordering::Relaxed),
            redeliveries: c.redeliveries.load(Ordering::Relaxed),
            dead_letters: c.dead_letters.load(Ordering::Relaxed),
            subscriptions: self.subscription_count(),
            in_flight: self.shared.in_flight.load(Ordering::SeqCst),
            event_types: self.event_types(),
        }
    }

    /// Reload the in-memory history from the journal
    pub fn restore(&self) -> eyre::Result<usize> {
        let Some(journal) = &self.journal else {
            return Ok(0);
        };
        let entries = journal.read::<Event>(EVENTS_STREAM)?;
        let count = entries.len();
        for entry in entries {
            self.remember(&Arc::new(entry.record));
        }
        info!(count, "EventBus::restore: reloaded event history");
        Ok(count)
    }

    fn remember(&self, event: &Arc<Event>) {
        if self.history_capacity > 0
            && let Ok(mut history) = self.history.lock()
        {
            history.push_back(event.clone());
            while history.len() > self.history_capacity {
                history.pop_front();
            }
        }
        if let Ok(mut counts) = self.type_counts.lock() {
            *counts.entry(event.event_type.clone()).or_default() += 1;
        }
    }
}

impl EventPublisher for EventBus {
    fn publish(&self, event: Event) -> Result<(), ValidationError> {
        EventBus::publish(self, event)
    }
}

impl EventSubscriber for EventBus {
    fn subscribe_handler(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> SubscriptionHandle {
        EventBus::subscribe_handler(self, event_type, handler)
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        EventBus::unsubscribe(self, handle)
    }
}

/// Drain one subscription's queue, retrying failed handlers
async fn deliver(
    mut rx: mpsc::UnboundedReceiver<Arc<Event>>,
    handler: Arc<dyn EventHandler>,
    subscription: u64,
    shared: Arc<Shared>,
    redelivery: Redelivery,
) {
    while let Some(event) = rx.recv().await {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let failure = match AssertUnwindSafe(handler.handle(event.clone())).catch_unwind().await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(DeliveryError::HandlerFailed {
                    subscription,
                    attempt,
                    message: format!("{:#}", e),
                }),
                Err(_) => Some(DeliveryError::HandlerPanicked { subscription, attempt }),
            };

            let Some(failure) = failure else {
                shared.counters.delivered.fetch_add(1, Ordering::Relaxed);
                break;
            };

            shared.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
            if attempt > redelivery.max_redeliveries {
                shared.counters.dead_letters.fetch_add(1, Ordering::Relaxed);
                error!(event_id = %event.id, event_type = %event.event_type, error = %failure, "EventBus: giving up on delivery");
                break;
            }

            warn!(event_id = %event.id, event_type = %event.event_type, error = %failure, "EventBus: handler failed, redelivering");
            shared.counters.redeliveries.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(redelivery.backoff * attempt).await;
        }
        shared.finish_one();
    }
    debug!(subscription, "EventBus: delivery task finished");
}
