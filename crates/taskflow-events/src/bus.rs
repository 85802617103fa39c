use crate::event::Event;
use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use taskflow_core::{TaskflowError, TaskflowResult};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default buffer capacity and history length.
pub const DEFAULT_CAPACITY: usize = 1000;
pub const DEFAULT_HISTORY_SIZE: usize = 1000;

/// Receives events of the types it was subscribed to.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> TaskflowResult<()>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskflowResult<()>> + Send + 'static,
{
    async fn handle(&self, event: &Event) -> TaskflowResult<()> {
        (self.f)(event.clone()).await
    }
}

/// Wrap an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskflowResult<()>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
}

#[derive(Default)]
struct Counters {
    published: u64,
    processed: u64,
    dropped: u64,
    evicted: u64,
    handler_errors: u64,
}

/// Point-in-time view of the bus.
#[derive(Debug, Clone, Serialize)]
pub struct EventBusStatistics {
    pub running: bool,
    pub queue_size: usize,
    pub capacity: usize,
    pub handlers_by_type: BTreeMap<String, usize>,
    pub total_handlers: usize,
    pub published: u64,
    pub processed: u64,
    pub dropped: u64,
    pub evicted: u64,
    pub handler_errors: u64,
    pub history_size: usize,
}

struct BusInner {
    capacity: usize,
    history_size: usize,
    queue: Mutex<VecDeque<Event>>,
    handlers: RwLock<HashMap<String, Vec<Subscription>>>,
    history: Mutex<VecDeque<Event>>,
    counters: Mutex<Counters>,
    running: AtomicBool,
    processing: AtomicBool,
    next_id: AtomicU64,
    wake: Notify,
    idle: Notify,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Bounded publish/subscribe bus with a single consumption loop.
///
/// Events are delivered in publish order. For each event every handler
/// subscribed to its type runs concurrently and the loop waits for all of
/// them before taking the next event. On overflow a `High`/`Critical` event
/// evicts the oldest queued event; lower priorities are dropped.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, DEFAULT_HISTORY_SIZE)
    }

    pub fn with_capacity(capacity: usize, history_size: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                capacity: capacity.max(1),
                history_size,
                queue: Mutex::new(VecDeque::new()),
                handlers: RwLock::new(HashMap::new()),
                history: Mutex::new(VecDeque::new()),
                counters: Mutex::new(Counters::default()),
                running: AtomicBool::new(false),
                processing: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                wake: Notify::new(),
                idle: Notify::new(),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Spawn the consumption loop on the current tokio runtime.
    pub fn start(&self) -> TaskflowResult<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            self.inner.running.store(false, Ordering::SeqCst);
            TaskflowError::Event(format!("event bus needs a tokio runtime: {e}"))
        })?;
        let inner = self.inner.clone();
        let handle = runtime.spawn(async move { inner.run().await });
        *self.inner.worker.lock() = Some(handle);
        info!(capacity = self.inner.capacity, "Event bus started");
        Ok(())
    }

    /// Stop accepting events, drain the queue, and wait for the loop to exit.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.wake.notify_one();
        let handle = self.inner.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Event bus loop terminated abnormally");
            }
        }
        info!("Event bus stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Queue an event without blocking. Returns `false` when the event was
    /// not queued (bus stopped, or buffer full at low/normal priority).
    pub fn publish(&self, event: Event) -> bool {
        {
            let mut queue = self.inner.queue.lock();
            // Read under the queue lock; the loop makes its exit decision
            // under the same lock.
            if !self.is_running() {
                warn!(event_type = %event.event_type, "Event bus not running, event not queued");
                return false;
            }
            if queue.len() >= self.inner.capacity {
                if !event.priority.may_evict() {
                    self.inner.counters.lock().dropped += 1;
                    warn!(
                        event_type = %event.event_type,
                        capacity = self.inner.capacity,
                        "Event queue full, dropping event"
                    );
                    return false;
                }
                if let Some(evicted) = queue.pop_front() {
                    self.inner.counters.lock().evicted += 1;
                    warn!(
                        evicted_type = %evicted.event_type,
                        event_type = %event.event_type,
                        "Event queue full, evicted oldest event for high-priority event"
                    );
                }
            }
            queue.push_back(event);
            self.inner.counters.lock().published += 1;
        }
        self.inner.wake.notify_one();
        true
    }

    /// Deliver an event inline, bypassing the queue. Handler errors are
    /// logged, as in the loop.
    pub async fn publish_immediate(&self, event: Event) {
        self.inner.counters.lock().published += 1;
        self.inner.deliver(event).await;
    }

    pub fn subscribe(
        &self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let event_type = event_type.into();
        debug!(event_type = %event_type, subscription = id.0, "Handler subscribed");
        self.inner
            .handlers
            .write()
            .entry(event_type)
            .or_default()
            .push(Subscription { id, handler });
        id
    }

    /// Remove a subscription. Returns `true` if it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.inner.handlers.write();
        let mut removed = false;
        handlers.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            removed |= subs.len() != before;
            !subs.is_empty()
        });
        removed
    }

    /// Resolve once the queue is empty and no event is being handled.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.is_idle() || self.inner.worker.lock().is_none() {
                return;
            }
            notified.await;
        }
    }

    /// Most recent handled events, oldest first, optionally filtered by type.
    pub fn event_history(&self, event_type: Option<&str>, limit: usize) -> Vec<Event> {
        let history = self.inner.history.lock();
        let mut matching: Vec<Event> = history
            .iter()
            .rev()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .take(limit)
            .cloned()
            .collect();
        matching.reverse();
        matching
    }

    pub fn clear_history(&self) {
        self.inner.history.lock().clear();
    }

    pub fn statistics(&self) -> EventBusStatistics {
        let handlers_by_type: BTreeMap<String, usize> = self
            .inner
            .handlers
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.len()))
            .collect();
        let total_handlers = handlers_by_type.values().sum();
        let queue_size = self.inner.queue.lock().len();
        let history_size = self.inner.history.lock().len();
        let counters = self.inner.counters.lock();
        EventBusStatistics {
            running: self.is_running(),
            queue_size,
            capacity: self.inner.capacity,
            handlers_by_type,
            total_handlers,
            published: counters.published,
            processed: counters.processed,
            dropped: counters.dropped,
            evicted: counters.evicted,
            handler_errors: counters.handler_errors,
            history_size,
        }
    }
}

impl BusInner {
    async fn run(self: Arc<Self>) {
        loop {
            let (next, stopped) = {
                let mut queue = self.queue.lock();
                let next = queue.pop_front();
                self.processing.store(next.is_some(), Ordering::SeqCst);
                let stopped = next.is_none() && !self.running.load(Ordering::SeqCst);
                (next, stopped)
            };
            match next {
                Some(event) => {
                    self.deliver(event).await;
                    self.processing.store(false, Ordering::SeqCst);
                }
                None if stopped => break,
                None => {
                    self.idle.notify_waiters();
                    self.wake.notified().await;
                }
            }
        }
        self.idle.notify_waiters();
    }

    fn is_idle(&self) -> bool {
        let queue = self.queue.lock();
        queue.is_empty() && !self.processing.load(Ordering::SeqCst)
    }

    async fn deliver(&self, event: Event) {
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .get(&event.event_type)
            .map(|subs| subs.iter().map(|s| s.handler.clone()).collect())
            .unwrap_or_default();

        {
            let mut history = self.history.lock();
            history.push_back(event.clone());
            while history.len() > self.history_size {
                history.pop_front();
            }
        }

        let outcomes = join_all(
            handlers
                .iter()
                .map(|h| AssertUnwindSafe(h.handle(&event)).catch_unwind()),
        )
        .await;

        let mut failures = 0u64;
        for outcome in outcomes {
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    error!(event_type = %event.event_type, error = %e, "Event handler failed");
                }
                Err(_) => {
                    failures += 1;
                    error!(event_type = %event.event_type, "Event handler panicked");
                }
            }
        }

        let mut counters = self.counters.lock();
        counters.processed += 1;
        counters.handler_errors += failures;
    }
}
