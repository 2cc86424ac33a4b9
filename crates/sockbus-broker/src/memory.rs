//! In-process broker.
//!
//! Topic membership lives in a `DashMap<topic, subscriber ids>`; every
//! subscriber owns a bounded delivery queue. A delivery that does not fit is
//! dropped and counted, matching the best-effort contract of a real broker.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use sockbus_core::errors::BrokerError;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{BROKER_DELIVERY_DROPS_TOTAL, Broker};
use crate::subscription::{BrokerMessage, Subscription, SubscriptionControl};

/// Default per-subscription queue capacity.
const DEFAULT_CAPACITY: usize = 100;

struct Inner {
    /// Topic → ids of subscriptions bound to it.
    topics: DashMap<String, HashSet<u64>>,
    /// Subscription id → delivery queue.
    senders: DashMap<u64, mpsc::Sender<BrokerMessage>>,
    next_id: AtomicU64,
    capacity: usize,
    closed: AtomicBool,
}

impl Inner {
    fn bind(&self, id: u64, topic: &str) {
        let _ = self.topics.entry(topic.to_owned()).or_default().insert(id);
    }

    fn unbind(&self, id: u64, topic: &str) {
        if let Some(mut ids) = self.topics.get_mut(topic) {
            let _ = ids.remove(&id);
        }
        let _ = self.topics.remove_if(topic, |_, ids| ids.is_empty());
    }
}

/// Broker whose topic state lives in this process.
///
/// Cloning is cheap; clones share the same topic space.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Create a broker with the default per-subscription capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a broker with a custom per-subscription capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: DashMap::new(),
                senders: DashMap::new(),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Number of open subscriptions bound to `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.topics.get(topic).map_or(0, |ids| ids.len())
    }

    /// Number of open subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.senders.len()
    }

    /// Simulate the broker connection dropping: every feed ends and further
    /// publish/subscribe calls fail.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.senders.clear();
        self.inner.topics.clear();
        debug!("memory broker closed");
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let ids: Vec<u64> = match self.inner.topics.get(topic) {
            Some(ids) => ids.iter().copied().collect(),
            None => return Ok(()),
        };

        for id in ids {
            let Some(tx) = self.inner.senders.get(&id).map(|tx| tx.value().clone()) else {
                continue;
            };
            let msg = BrokerMessage {
                topic: topic.to_owned(),
                payload: payload.clone(),
            };
            match tx.try_send(msg) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    counter!(BROKER_DELIVERY_DROPS_TOTAL).increment(1);
                    warn!(topic, subscription = id, "delivery queue full, dropping message");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<Subscription, BrokerError> {
        self.ensure_open()?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let _ = self.inner.senders.insert(id, tx);
        for topic in topics {
            self.inner.bind(id, topic);
        }
        if self.inner.closed.load(Ordering::Acquire) {
            // Lost a race with `close`; undo the bindings it could not see.
            let _ = self.inner.senders.remove(&id);
            for topic in topics {
                self.inner.unbind(id, topic);
            }
            return Err(BrokerError::Closed);
        }

        let control = MemorySubscription {
            id,
            inner: Arc::clone(&self.inner),
            topics: Mutex::new(topics.iter().cloned().collect()),
            closed: AtomicBool::new(false),
        };
        debug!(subscription = id, ?topics, "subscription opened");
        Ok(Subscription::new(Arc::new(control), rx))
    }
}

/// Control half of a [`MemoryBroker`] subscription.
struct MemorySubscription {
    id: u64,
    inner: Arc<Inner>,
    topics: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl MemorySubscription {
    fn ensure_open(&self, topics: &[String]) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) || self.inner.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Subscribe {
                topics: topics.to_vec(),
                reason: "subscription closed".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionControl for MemorySubscription {
    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        let mut own = self.topics.lock();
        // Checked under the lock so a concurrent close cannot be undone.
        self.ensure_open(topics)?;
        for topic in topics {
            if own.insert(topic.clone()) {
                self.inner.bind(self.id, topic);
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        let mut own = self.topics.lock();
        self.ensure_open(topics)?;
        for topic in topics {
            if own.remove(topic) {
                self.inner.unbind(self.id, topic);
            }
        }
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut own = self.topics.lock();
        for topic in own.drain() {
            self.inner.unbind(self.id, &topic);
        }
        drop(own);
        let _ = self.inner.senders.remove(&self.id);
        debug!(subscription = self.id, "subscription closed");
    }

    fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.lock().iter().cloned().collect();
        topics.sort();
        topics
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
