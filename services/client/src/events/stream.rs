//! Threshold-driven event stream.
//!
//! A stream folds pushed events into its aggregator and emits the
//! accumulated state when a counter or byte-size threshold is crossed, or
//! periodically at the smallest installed time threshold. Thresholds come
//! from server-directed subscriptions; with none installed the stream still
//! folds pushes but never emits.

use super::aggregator::Aggregator;
use super::types::StreamEvent;
use crate::comm::OutboundStream;
use crate::scheduler::{CancelHandle, Scheduler};
use remora_proto::EventSubscriptionWire;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::debug;

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Ordered multiset of threshold values.
///
/// Unconstrained dimensions are stored as `u64::MAX`, so `min()` on an
/// effectively-unconstrained set is the sentinel and the emission rule can
/// never trip on it.
#[derive(Debug, Default)]
pub struct ThresholdSet {
    counts: BTreeMap<u64, usize>,
    len: usize,
}

impl ThresholdSet {
    pub fn insert(&mut self, value: u64) {
        *self.counts.entry(value).or_insert(0) += 1;
        self.len += 1;
    }

    /// Remove one occurrence of `value`. Returns false if absent.
    pub fn remove(&mut self, value: u64) -> bool {
        match self.counts.get_mut(&value) {
            Some(count) if *count > 1 => {
                *count -= 1;
            }
            Some(_) => {
                self.counts.remove(&value);
            }
            None => return false,
        }
        self.len -= 1;
        true
    }

    pub fn min(&self) -> u64 {
        self.counts.keys().next().copied().unwrap_or(u64::MAX)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// An installed event subscription's thresholds, sentinel-filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSubscription {
    pub id: i64,
    pub counter_threshold: u64,
    pub time_threshold_ms: u64,
    pub size_threshold: u64,
}

impl From<&EventSubscriptionWire> for EventSubscription {
    fn from(wire: &EventSubscriptionWire) -> Self {
        EventSubscription {
            id: wire.id,
            counter_threshold: wire.counter_threshold.unwrap_or(u64::MAX),
            time_threshold_ms: wire.time_threshold_ms.unwrap_or(u64::MAX),
            size_threshold: wire.size_threshold.unwrap_or(u64::MAX),
        }
    }
}

// ---------------------------------------------------------------------------
// EventStream
// ---------------------------------------------------------------------------

struct StreamInner<E: StreamEvent> {
    subscriptions: HashMap<i64, EventSubscription>,
    counter_thresholds: ThresholdSet,
    time_thresholds: ThresholdSet,
    size_thresholds: ThresholdSet,
    aggregator: Aggregator<E>,
    periodic: CancelHandle,
}

/// Aggregation and emission of one event type.
///
/// A single mutex guards the whole stream; every critical section is O(1)
/// in the number of pending files.
pub struct EventStream<E: StreamEvent> {
    label: &'static str,
    weak: Weak<EventStream<E>>,
    scheduler: Scheduler,
    transport: Arc<OutboundStream>,
    inner: Mutex<StreamInner<E>>,
}

impl<E: StreamEvent> EventStream<E> {
    pub fn new(
        label: &'static str,
        scheduler: Scheduler,
        transport: Arc<OutboundStream>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| EventStream {
            label,
            weak: weak.clone(),
            scheduler,
            transport,
            inner: Mutex::new(StreamInner {
                subscriptions: HashMap::new(),
                counter_thresholds: ThresholdSet::default(),
                time_thresholds: ThresholdSet::default(),
                size_thresholds: ThresholdSet::default(),
                aggregator: Aggregator::null(),
                periodic: CancelHandle::noop(),
            }),
        })
    }

    /// Fold an event in; emits if a threshold is crossed. Never blocks on
    /// I/O — the transport dispatch is fire-and-forget.
    pub fn push(&self, event: E) {
        let mut inner = self.inner.lock().unwrap();
        inner.aggregator.fold(event);
        if rule_satisfied(&inner) {
            self.emit_locked(&mut inner);
        }
    }

    /// Install a subscription's thresholds. Emits immediately when the
    /// accumulated state already satisfies the tightened rule; otherwise
    /// reschedules the periodic timer if the minimum time threshold moved.
    /// The second installed subscription upgrades aggregation to per-file.
    pub fn add_subscription(&self, subscription: EventSubscription) {
        let mut inner = self.inner.lock().unwrap();
        if inner.subscriptions.contains_key(&subscription.id) {
            return;
        }
        let old_min_time = inner.time_thresholds.min();
        inner.counter_thresholds.insert(subscription.counter_threshold);
        inner.time_thresholds.insert(subscription.time_threshold_ms);
        inner.size_thresholds.insert(subscription.size_threshold);
        inner.subscriptions.insert(subscription.id, subscription);

        if rule_satisfied(&inner) {
            self.emit_locked(&mut inner);
        } else if inner.time_thresholds.min() != old_min_time {
            self.reschedule_periodic(&mut inner);
        }
        if inner.counter_thresholds.len() == 2 {
            inner.aggregator.upgrade_to_file_id();
        }
        debug!(
            stream = self.label,
            id = subscription.id,
            installed = inner.subscriptions.len(),
            "subscription added"
        );
    }

    /// Remove a subscription's thresholds by id. Returns false when the id
    /// is not installed on this stream. Removing the last subscription
    /// downgrades aggregation and stops the periodic timer.
    pub fn remove_subscription(&self, id: i64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(subscription) = inner.subscriptions.remove(&id) else {
            return false;
        };
        let old_min_time = inner.time_thresholds.min();
        inner.counter_thresholds.remove(subscription.counter_threshold);
        inner.time_thresholds.remove(subscription.time_threshold_ms);
        inner.size_thresholds.remove(subscription.size_threshold);

        if inner.counter_thresholds.is_empty() {
            inner.aggregator.downgrade_to_null();
        }
        if inner.subscriptions.is_empty() || inner.time_thresholds.min() != old_min_time {
            self.reschedule_periodic(&mut inner);
        }
        debug!(stream = self.label, id, "subscription removed");
        true
    }

    pub fn has_subscription(&self, id: i64) -> bool {
        self.inner.lock().unwrap().subscriptions.contains_key(&id)
    }

    /// Force-emit the accumulated state (unmount/shutdown path).
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.emit_locked(&mut inner);
    }

    fn periodic_emission(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.emit_locked(&mut inner);
    }

    fn emit_locked(&self, inner: &mut StreamInner<E>) {
        let events = inner.aggregator.drain();
        if !events.is_empty() {
            debug!(stream = self.label, emitted = events.len(), "emitting events");
        }
        for event in events {
            self.transport.send(event.into_wire());
        }
        self.reschedule_periodic(inner);
    }

    fn reschedule_periodic(&self, inner: &mut StreamInner<E>) {
        inner.periodic.cancel();
        let min_time = inner.time_thresholds.min();
        if min_time == u64::MAX || inner.subscriptions.is_empty() {
            inner.periodic = CancelHandle::noop();
            return;
        }
        let weak = self.weak.clone();
        inner.periodic = self
            .scheduler
            .schedule(Duration::from_millis(min_time), move || {
                if let Some(stream) = weak.upgrade() {
                    stream.periodic_emission();
                }
            });
    }
}

fn rule_satisfied<E: StreamEvent>(inner: &StreamInner<E>) -> bool {
    let totals = inner.aggregator.totals();
    totals.counter >= inner.counter_thresholds.min()
        || totals.size >= inner.size_thresholds.min()
}
