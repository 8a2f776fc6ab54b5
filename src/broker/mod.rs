//! Pub/sub transport used by the arbiter and the viewer sessions.
//!
//! Two implementations:
//! - `MemoryBroker`: in-process, single node and tests (supports fault injection)
//! - `RedisBroker`: Redis PUBLISH/SUBSCRIBE for multi-node deployments

pub mod memory;
pub mod redis_pubsub;
pub mod retry;

pub use self::memory::MemoryBroker;
pub use self::redis_pubsub::RedisBroker;
pub use self::retry::RetryPolicy;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;

/// One message as delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: String,
}

/// Live subscription to one topic. Dropping it stops delivery.
///
/// `recv` returning `None` means the transport dropped the subscription
/// and the caller has to subscribe again once reconnected.
pub struct Subscription {
    topic: String,
    rx: mpsc::Receiver<BrokerMessage>,
    forwarder: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(topic: String, rx: mpsc::Receiver<BrokerMessage>, forwarder: JoinHandle<()>) -> Self {
        Self { topic, rx, forwarder }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&mut self) -> Option<BrokerMessage> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("topic", &self.topic).finish()
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Establish (or re-establish) the transport. Cheap when already connected.
    async fn connect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn publish(&self, topic: &str, payload: String) -> Result<()>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}

/// Serialize `message` as JSON and publish it once.
pub async fn publish_json<T: Serialize + ?Sized>(broker: &dyn Broker, topic: &str, message: &T) -> Result<()> {
    let payload = serde_json::to_string(message)?;
    broker.publish(topic, payload).await
}
