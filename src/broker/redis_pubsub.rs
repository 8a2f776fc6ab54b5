//! Redis PUBLISH/SUBSCRIBE broker for multi-node deployments.

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use super::{Broker, BrokerMessage, Subscription};
use crate::error::{CoordinatorError, Result};
use crate::redis_client::RedisClient;

pub struct RedisBroker {
    url: String,
    client: RwLock<Option<RedisClient>>,
    connected: Arc<AtomicBool>,
    buffer_size: usize,
}

impl RedisBroker {
    /// Does not touch the network; call `connect` (or let the presence
    /// channel do it).
    pub fn new(url: &str, buffer_size: usize) -> Self {
        Self {
            url: url.to_string(),
            client: RwLock::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            buffer_size: buffer_size.max(1),
        }
    }

    async fn current(&self) -> Result<RedisClient> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| CoordinatorError::ConnectionError("not connected to redis".to_string()))
    }

    fn lost(&self, err: redis::RedisError) -> CoordinatorError {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            self.connected.store(false, Ordering::SeqCst);
        }
        CoordinatorError::from(err)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        info!("Connecting to redis broker at {}", self.url);
        let client = RedisClient::new(&self.url).await?;
        *self.client.write().await = Some(client);
        self.connected.store(true, Ordering::SeqCst);
        info!("Redis broker connected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        let mut client = self.current().await?;
        let receivers: i64 = client
            .conn
            .publish(topic, payload)
            .await
            .map_err(|e| self.lost(e))?;
        debug!("Published to {} ({} receivers)", topic, receivers);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let client = self.current().await?;
        let mut pubsub = client.pubsub().await.map_err(|e| self.lost(e))?;
        pubsub.subscribe(topic).await.map_err(|e| self.lost(e))?;

        let (tx, rx) = mpsc::channel(self.buffer_size);
        let connected = self.connected.clone();
        let name = topic.to_string();
        let forwarder = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        error!("Undecodable payload on {}: {}", name, e);
                        continue;
                    }
                };
                let message = BrokerMessage {
                    topic: msg.get_channel_name().to_string(),
                    payload,
                };
                if tx.send(message).await.is_err() {
                    // subscriber went away
                    return;
                }
            }
            warn!("Redis subscription to {} ended, marking broker disconnected", name);
            connected.store(false, Ordering::SeqCst);
        });

        Ok(Subscription::new(topic.to_string(), rx, forwarder))
    }
}
