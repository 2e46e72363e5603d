use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::json;

use crate::error::SubscriberError;
use crate::logging::{LogLevel, Logger, emit, json_kv, json_str};
use crate::metrics::{self, SharedMetrics};

use super::event::{Event, EventFilter, OutgoingEvent};

const LOG_TARGET: &str = "panel_sync::bus";

pub type EventHandler = Box<dyn Fn(&Event) -> Result<(), SubscriberError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Configuration knobs for the bus.
#[derive(Clone, Default)]
pub struct BusConfig {
    pub logger: Option<Logger>,
    pub metrics: Option<SharedMetrics>,
}

struct HandlerCell {
    active: AtomicBool,
    handler: EventHandler,
}

#[derive(Clone)]
struct Slot {
    id: SubscriptionId,
    filter: EventFilter,
    /// First sequence this subscriber is eligible for.
    since: u64,
    handler: Weak<HandlerCell>,
}

struct Queued(Event);

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Max-heap: higher priority first, then lower sequence first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.sequence.cmp(&self.0.sequence))
    }
}

struct BusState {
    next_sequence: u64,
    next_subscription: u64,
    queue: BinaryHeap<Queued>,
    slots: Vec<Slot>,
    draining: bool,
}

impl Default for BusState {
    fn default() -> Self {
        Self {
            next_sequence: 1,
            next_subscription: 1,
            queue: BinaryHeap::new(),
            slots: Vec::new(),
            draining: false,
        }
    }
}

struct BusShared {
    state: Mutex<BusState>,
    config: BusConfig,
}

impl BusShared {
    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut state = self.lock();
        let before = state.slots.len();
        state.slots.retain(|slot| slot.id != id);
        before != state.slots.len()
    }
}

/// Sequenced, prioritized event bus. Cloning yields another handle to the same bus.
///
/// `broadcast` drains the queue before returning. A handler that broadcasts
/// only enqueues; the outer drain picks the new event up once the current one
/// has reached every subscriber. When another thread is already draining, the
/// event is enqueued and delivered by that thread.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<BusShared>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    pub fn with_config(config: BusConfig) -> Self {
        Self {
            shared: Arc::new(BusShared {
                state: Mutex::new(BusState::default()),
                config,
            }),
        }
    }

    /// Register `handler` for events matching `filter`. Only events broadcast
    /// after this call are delivered. Dropping the returned handle unsubscribes.
    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> Subscription
    where
        F: Fn(&Event) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        let cell = Arc::new(HandlerCell {
            active: AtomicBool::new(true),
            handler: Box::new(handler),
        });

        let id = {
            let mut state = self.shared.lock();
            let id = SubscriptionId(state.next_subscription);
            state.next_subscription += 1;
            let since = state.next_sequence;
            state.slots.push(Slot {
                id,
                filter,
                since,
                handler: Arc::downgrade(&cell),
            });
            id
        };

        self.log(
            LogLevel::Trace,
            "subscribed",
            [json_str("subscription", id.to_string())],
        );

        Subscription {
            id,
            cell: Some(cell),
            bus: Arc::downgrade(&self.shared),
        }
    }

    pub fn subscribe_type<F>(&self, event_type: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Event) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        self.subscribe(EventFilter::event_type(event_type), handler)
    }

    /// Sequence, enqueue and deliver `event`. Returns the assigned sequence.
    pub fn broadcast(&self, event: OutgoingEvent) -> u64 {
        let (sequence, should_drain) = {
            let mut state = self.shared.lock();
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.queue.push(Queued(Event::stamp(event, sequence)));
            let should_drain = !state.draining;
            state.draining = true;
            (sequence, should_drain)
        };

        metrics::record(self.shared.config.metrics.as_ref(), |m| {
            m.record_broadcast()
        });

        if should_drain {
            self.drain();
        }
        sequence
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.handler.strong_count() > 0)
            .count()
    }

    /// Events waiting in the queue (non-zero only while a drain is in progress).
    pub fn pending(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn last_sequence(&self) -> u64 {
        self.shared.lock().next_sequence - 1
    }

    fn drain(&self) {
        let mut guard = DrainGuard {
            shared: &self.shared,
            armed: true,
        };
        loop {
            let (event, slots) = {
                let mut state = self.shared.lock();
                let Some(Queued(event)) = state.queue.pop() else {
                    state.draining = false;
                    guard.armed = false;
                    break;
                };
                state.slots.retain(|slot| slot.handler.strong_count() > 0);
                let slots: Vec<Slot> = state
                    .slots
                    .iter()
                    .filter(|slot| slot.since <= event.sequence)
                    .cloned()
                    .collect();
                (event, slots)
            };
            self.deliver(&event, slots);
        }
    }

    fn deliver(&self, event: &Event, slots: Vec<Slot>) {
        let mut delivered = 0usize;
        for slot in slots {
            let Some(cell) = slot.handler.upgrade() else {
                continue;
            };
            if !cell.active.load(AtomicOrdering::Acquire) {
                continue;
            }

            // Predicates are subscriber code too.
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                if !slot.filter.matches(event) {
                    return Ok(false);
                }
                (cell.handler)(event).map(|()| true)
            }))
            .unwrap_or_else(|panic| Err(SubscriberError::Panicked(panic_message(&*panic))));

            match outcome {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(err) => self.report_failure(event, slot.id, &err),
            }
        }

        metrics::record(self.shared.config.metrics.as_ref(), |m| {
            m.record_deliveries(delivered)
        });
        self.log(
            LogLevel::Debug,
            "event_dispatched",
            [
                json_str("event_type", event.event_type.clone()),
                json_kv("sequence", json!(event.sequence)),
                json_str("source", event.source.clone()),
                json_kv("delivered", json!(delivered)),
            ],
        );
    }

    fn report_failure(&self, event: &Event, id: SubscriptionId, err: &SubscriberError) {
        metrics::record(self.shared.config.metrics.as_ref(), |m| {
            m.record_subscriber_failure()
        });
        self.log(
            LogLevel::Warn,
            "subscriber_failed",
            [
                json_str("event_type", event.event_type.clone()),
                json_kv("sequence", json!(event.sequence)),
                json_str("source", event.source.clone()),
                json_str("subscription", id.to_string()),
                json_str("error", err.to_string()),
            ],
        );
    }

    fn log<I>(&self, level: LogLevel, message: &str, fields: I)
    where
        I: IntoIterator<Item = (String, serde_json::Value)>,
    {
        emit(
            self.shared.config.logger.as_ref(),
            level,
            LOG_TARGET,
            message,
            fields,
        );
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Releases the drain flag if delivery unwinds, so later broadcasts drain again.
struct DrainGuard<'a> {
    shared: &'a BusShared,
    armed: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.lock().draining = false;
        }
    }
}

/// Owning handle for a bus registration. The bus keeps only a weak reference
/// to the handler; unsubscribing (explicitly or on drop) is idempotent.
pub struct Subscription {
    id: SubscriptionId,
    cell: Option<Arc<HandlerCell>>,
    bus: Weak<BusShared>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.cell.is_some()
    }

    pub fn unsubscribe(&mut self) {
        let Some(cell) = self.cell.take() else {
            return;
        };
        cell.active.store(false, AtomicOrdering::Release);
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
