//! # sockbus-broker
//!
//! Thin bridge over an external publish/subscribe broker.
//!
//! - [`Broker`]: publish bytes to a topic, open a [`Subscription`]
//! - [`Subscription`]: one [`SubscriptionHandle`] (mutable topic set, close)
//!   plus one [`Feed`] (lazy, unbounded-in-time sequence of deliveries)
//! - [`MemoryBroker`]: in-process implementation; several servers sharing
//!   one instance behave like processes sharing one broker
//!
//! Delivery is best-effort: a publish to a topic with no current subscriber
//! is dropped without error, and there is no replay. Order is preserved per
//! topic per subscriber, never across topics.

#![deny(unsafe_code)]

pub mod memory;
pub mod subscription;

use async_trait::async_trait;
use bytes::Bytes;
use sockbus_core::errors::BrokerError;

pub use memory::MemoryBroker;
pub use subscription::{BrokerMessage, Feed, Subscription, SubscriptionControl, SubscriptionHandle};

/// Counter of deliveries dropped because a subscription queue was full.
pub const BROKER_DELIVERY_DROPS_TOTAL: &str = "broker_delivery_drops_total";

/// A topic-based publish/subscribe service.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Publish `payload` to every current subscriber of `topic`.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Open a subscription bound to `topics`.
    async fn subscribe(&self, topics: &[String]) -> Result<Subscription, BrokerError>;
}
