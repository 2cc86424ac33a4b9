//! Subscription handle and delivery feed.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use sockbus_core::errors::BrokerError;
use tokio::sync::mpsc;

/// One delivery from the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Topic the payload was published to.
    pub topic: String,
    /// Raw published bytes.
    pub payload: Bytes,
}

/// Broker-side operations on an open subscription.
#[async_trait]
pub trait SubscriptionControl: Send + Sync + 'static {
    /// Add topics to the subscription. Already-subscribed topics are a no-op.
    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError>;

    /// Remove topics from the subscription. Unknown topics are a no-op.
    async fn unsubscribe(&self, topics: &[String]) -> Result<(), BrokerError>;

    /// Close the subscription; the feed ends once drained. Idempotent.
    async fn close(&self);

    /// Snapshot of the currently subscribed topics.
    fn topics(&self) -> Vec<String>;

    /// Whether [`close`](Self::close) has run.
    fn is_closed(&self) -> bool;
}

/// Cloneable control handle for one subscription.
#[derive(Clone)]
pub struct SubscriptionHandle {
    control: Arc<dyn SubscriptionControl>,
}

impl SubscriptionHandle {
    /// Wrap a broker-specific control.
    pub fn new(control: Arc<dyn SubscriptionControl>) -> Self {
        Self { control }
    }

    /// Subscribe to one more topic.
    pub async fn join(&self, topic: &str) -> Result<(), BrokerError> {
        self.control.subscribe(&[topic.to_owned()]).await
    }

    /// Unsubscribe from one topic.
    pub async fn leave(&self, topic: &str) -> Result<(), BrokerError> {
        self.control.unsubscribe(&[topic.to_owned()]).await
    }

    /// Close the subscription.
    pub async fn close(&self) {
        self.control.close().await;
    }

    /// Currently subscribed topics.
    pub fn topics(&self) -> Vec<String> {
        self.control.topics()
    }

    /// Whether the subscription is closed.
    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("topics", &self.topics())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Delivery feed of one subscription.
///
/// Yields messages until the subscription is closed or the broker drops it.
#[derive(Debug)]
pub struct Feed {
    pub(crate) rx: mpsc::Receiver<BrokerMessage>,
}

impl Feed {
    /// Build a feed from the receiving half of a delivery queue.
    pub fn new(rx: mpsc::Receiver<BrokerMessage>) -> Self {
        Self { rx }
    }

    /// Next delivery, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<BrokerMessage> {
        self.rx.recv().await
    }
}

impl Stream for Feed {
    type Item = BrokerMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// An open subscription: control handle plus delivery feed.
#[derive(Debug)]
pub struct Subscription {
    /// Control half, shareable.
    pub handle: SubscriptionHandle,
    /// Delivery half, owned by exactly one consumer.
    pub feed: Feed,
}

impl Subscription {
    /// Assemble from parts.
    pub fn new(control: Arc<dyn SubscriptionControl>, rx: mpsc::Receiver<BrokerMessage>) -> Self {
        Self {
            handle: SubscriptionHandle::new(control),
            feed: Feed::new(rx),
        }
    }

    /// Split into handle and feed.
    pub fn into_parts(self) -> (SubscriptionHandle, Feed) {
        (self.handle, self.feed)
    }
}
