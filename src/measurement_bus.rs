//! # Measurement Bus
//!
//! In-process topic bus carrying snapshot envelopes from the polling workers
//! to subscribers (the transport bridge, diagnostics, tests).
//!
//! - `publish` never blocks: each subscriber owns a bounded queue and a full
//!   queue drops its oldest message.
//! - Patterns are exact topics or end in a `*` path component
//!   (`measurements/*`, `*`).
//! - One publisher's messages reach one subscriber in publish order.
//!
//! The bus also keeps the latest snapshot per device in a copy-on-write map
//! behind an [`ArcSwap`]; readers such as the safety loop load it without
//! locking.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::constants::{DEFAULT_SUBSCRIBER_CAPACITY, MEASUREMENT_TOPIC_PREFIX};
use crate::error::{GatewayError, GatewayResult};
use crate::snapshot::Snapshot;

/// One published message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TopicPattern {
    Exact(String),
    Prefix(String),
}

impl TopicPattern {
    fn parse(pattern: &str) -> GatewayResult<Self> {
        let Some(prefix) = pattern.strip_suffix('*') else {
            if pattern.contains('*') || pattern.is_empty() {
                return Err(GatewayError::InvalidPattern(pattern.to_string()));
            }
            return Ok(Self::Exact(pattern.to_string()));
        };
        if prefix.contains('*') || !(prefix.is_empty() || prefix.ends_with('/')) {
            return Err(GatewayError::InvalidPattern(pattern.to_string()));
        }
        Ok(Self::Prefix(prefix.to_string()))
    }

    fn matches(&self, topic: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == topic,
            Self::Prefix(prefix) => topic.len() > prefix.len() && topic.starts_with(prefix.as_str()),
        }
    }
}

struct SubscriberQueue {
    pattern: TopicPattern,
    capacity: usize,
    messages: Mutex<VecDeque<Message>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl SubscriberQueue {
    fn push(&self, message: Message) {
        {
            let mut messages = self.messages.lock();
            if messages.len() >= self.capacity {
                messages.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            messages.push_back(message);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// Receiving end of a subscription. Dropping it unsubscribes.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    /// Next message; `None` once the bus is closed and the queue drained
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            if let Some(message) = self.try_recv() {
                return Some(message);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return self.try_recv();
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.queue.messages.lock().pop_front()
    }

    /// Messages discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.queue.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type SnapshotCache = HashMap<String, Arc<Snapshot>>;

pub struct MeasurementBus {
    subscribers: Mutex<Vec<Weak<SubscriberQueue>>>,
    capacity: usize,
    cache: ArcSwap<SnapshotCache>,
    cache_writer: Mutex<()>,
    closed: AtomicBool,
    published: AtomicU64,
}

impl Default for MeasurementBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl MeasurementBus {
    /// `capacity` bounds every subscriber queue
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            cache: ArcSwap::from_pointee(HashMap::new()),
            cache_writer: Mutex::new(()),
            closed: AtomicBool::new(false),
            published: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, pattern: &str) -> GatewayResult<Subscription> {
        let queue = Arc::new(SubscriberQueue {
            pattern: TopicPattern::parse(pattern)?,
            capacity: self.capacity,
            messages: Mutex::new(VecDeque::with_capacity(self.capacity.min(64))),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(self.is_closed()),
        });
        self.subscribers.lock().push(Arc::downgrade(&queue));
        debug!(pattern, "subscribed");
        Ok(Subscription { queue })
    }

    /// Deliver `payload` to every matching subscriber without blocking.
    pub fn publish(&self, topic: &str, payload: Bytes) {
        if self.is_closed() {
            trace!(topic, "bus closed, message discarded");
            return;
        }
        let targets: Vec<Arc<SubscriberQueue>> = {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|weak| weak.strong_count() > 0);
            subscribers.iter().filter_map(Weak::upgrade).collect()
        };
        self.published.fetch_add(1, Ordering::Relaxed);

        for queue in targets.iter().filter(|q| q.pattern.matches(topic)) {
            queue.push(Message {
                topic: topic.to_string(),
                payload: payload.clone(),
            });
        }
    }

    /// Record `snapshot` as the device's latest and publish its envelope on
    /// `measurements/<device>`.
    pub fn publish_snapshot(&self, snapshot: Snapshot) -> GatewayResult<()> {
        let payload = snapshot.to_json()?;
        let topic = format!("{MEASUREMENT_TOPIC_PREFIX}{}", snapshot.device_name);
        {
            let _writer = self.cache_writer.lock();
            let mut next = SnapshotCache::clone(&self.cache.load());
            next.insert(snapshot.device_name.clone(), Arc::new(snapshot));
            self.cache.store(Arc::new(next));
        }
        self.publish(&topic, payload);
        Ok(())
    }

    /// Latest snapshot of every device that has published one
    pub fn latest(&self) -> Arc<SnapshotCache> {
        self.cache.load_full()
    }

    pub fn latest_for(&self, device: &str) -> Option<Arc<Snapshot>> {
        self.cache.load().get(device).cloned()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting messages and wake every subscriber. Queued messages
    /// stay readable.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let subscribers = std::mem::take(&mut *self.subscribers.lock());
        for queue in subscribers.iter().filter_map(Weak::upgrade) {
            queue.close();
        }
        info!(published = self.published(), "measurement bus closed");
    }
}

// ============================================================================
// Downstream transport
// ============================================================================

/// Downstream `publish(topic, bytes)` capability
pub trait TransportSink: Send + Sync + 'static {
    fn publish(&self, topic: &str, payload: Bytes) -> GatewayResult<()>;
}

/// Sink that logs every payload; the default when no transport is wired
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TransportSink for TracingSink {
    fn publish(&self, topic: &str, payload: Bytes) -> GatewayResult<()> {
        info!(topic, payload = %String::from_utf8_lossy(&payload), "publish");
        Ok(())
    }
}

/// Sink that forwards into a bounded channel without waiting
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Message>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl TransportSink for ChannelSink {
    fn publish(&self, topic: &str, payload: Bytes) -> GatewayResult<()> {
        self.tx
            .try_send(Message {
                topic: topic.to_string(),
                payload,
            })
            .map_err(|err| GatewayError::Sink(err.to_string()))
    }
}

/// Forward every `measurements/*` message to `sink` until the bus is closed
/// and drained. Sink errors are logged and the message is lost.
pub fn spawn_bridge(
    bus: &MeasurementBus,
    sink: Arc<dyn TransportSink>,
) -> GatewayResult<JoinHandle<()>> {
    let mut subscription = bus.subscribe(&format!("{MEASUREMENT_TOPIC_PREFIX}*"))?;
    Ok(tokio::spawn(async move {
        let mut forwarded = 0u64;
        while let Some(message) = subscription.recv().await {
            match sink.publish(&message.topic, message.payload) {
                Ok(()) => forwarded += 1,
                Err(err) => warn!(topic = %message.topic, error = %err, "sink rejected message"),
            }
        }
        info!(forwarded, dropped = subscription.dropped(), "transport bridge stopped");
    }))
}
