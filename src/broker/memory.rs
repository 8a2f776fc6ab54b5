//! In-memory broker for single-node deployments and tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, warn};

use super::{Broker, BrokerMessage, Subscription};
use crate::error::{CoordinatorError, Result};

/// Topic fan-out over `tokio::sync::broadcast`.
///
/// The network can be taken down and brought back (`go_offline` /
/// `go_online`) and individual connects or publishes can be made to fail,
/// which is how reconnect and retry paths are exercised.
#[derive(Debug)]
pub struct MemoryBroker {
    /// Topic name -> broadcast sender. Topics without receivers are pruned.
    topics: RwLock<HashMap<String, broadcast::Sender<BrokerMessage>>>,
    buffer_size: usize,
    online: AtomicBool,
    connected: AtomicBool,
    failing_connects: AtomicU32,
    failing_publishes: AtomicU32,
    published: AtomicU64,
}

impl MemoryBroker {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            buffer_size: buffer_size.max(1),
            online: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            failing_connects: AtomicU32::new(0),
            failing_publishes: AtomicU32::new(0),
            published: AtomicU64::new(0),
        }
    }

    /// Drop the network. Every live subscription ends.
    pub async fn go_offline(&self) {
        self.online.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.topics.write().await.clear();
        warn!("memory broker went offline");
    }

    /// Bring the network back. Clients still have to `connect`.
    pub fn go_online(&self) {
        self.online.store(true, Ordering::SeqCst);
        debug!("memory broker back online");
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_publishes(&self, n: u32) {
        self.failing_publishes.store(n, Ordering::SeqCst);
    }

    /// Messages accepted for delivery so far.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Topics that still have a sender registered.
    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    async fn prune_if_unused(&self, topic: &str) {
        let mut topics = self.topics.write().await;
        if topics.get(topic).is_some_and(|tx| tx.receiver_count() == 0) {
            topics.remove(topic);
            debug!("pruned topic {} with no subscribers", topic);
        }
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<()> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(CoordinatorError::ConnectionError("broker unreachable".to_string()));
        }
        if Self::take_failure(&self.failing_connects) {
            return Err(CoordinatorError::ConnectionError("connection refused".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.online.load(Ordering::SeqCst) && self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        if !self.is_connected() {
            return Err(CoordinatorError::ConnectionError("not connected".to_string()));
        }
        if Self::take_failure(&self.failing_publishes) {
            return Err(CoordinatorError::ConnectionError(format!("publish to {} dropped", topic)));
        }

        let unused = {
            let topics = self.topics.read().await;
            match topics.get(topic) {
                // no receivers is fine, pub/sub does not buffer for absent listeners
                Some(tx) => tx
                    .send(BrokerMessage {
                        topic: topic.to_string(),
                        payload,
                    })
                    .is_err(),
                None => false,
            }
        };
        if unused {
            self.prune_if_unused(topic).await;
        }
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        if !self.is_connected() {
            return Err(CoordinatorError::ConnectionError("not connected".to_string()));
        }

        let mut source = {
            let mut topics = self.topics.write().await;
            topics.retain(|_, tx| tx.receiver_count() > 0);
            topics
                .entry(topic.to_string())
                .or_insert_with(|| broadcast::channel(self.buffer_size).0)
                .subscribe()
        };

        let (tx, rx) = mpsc::channel(self.buffer_size);
        let name = topic.to_string();
        let forwarder = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("subscriber on {} lagged, {} messages skipped", name, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(topic.to_string(), rx, forwarder))
    }
}
