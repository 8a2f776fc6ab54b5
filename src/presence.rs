//! Viewer attention on showings, and the process-wide broker connectivity.
//!
//! Every (scope, viewer, showing) triple holds at most one live subscription
//! to the showing's seat topic. A scope is one session, so a viewer with two
//! sessions open on a showing gets two streams. The per-showing viewer counts
//! drive seat map eviction: a showing with no viewers left has nothing to keep
//! in memory.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broker::{Broker, RetryPolicy, Subscription};
use crate::config::BrokerConfig;
use crate::error::{CoordinatorError, Result};
use crate::topics::TopicRouter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connected,
    Connecting,
    Disconnected,
}

/// Registration of one viewer on one showing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceHandle {
    id: u64,
    scope: u64,
    viewer_id: String,
    showing_id: String,
    topic: String,
}

impl PresenceHandle {
    pub fn scope(&self) -> u64 {
        self.scope
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    pub fn showing_id(&self) -> &str {
        &self.showing_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Result of `subscribe`. `stream` is `None` when the viewer was already
/// subscribed in the same scope; the stream handed out the first time is
/// still live.
#[derive(Debug)]
pub struct Attached {
    pub handle: PresenceHandle,
    pub stream: Option<Subscription>,
}

pub struct PresenceChannel {
    broker: Arc<dyn Broker>,
    router: TopicRouter,
    retry: RetryPolicy,
    connect_timeout: Duration,
    state: watch::Sender<ConnectionState>,
    connect_lock: tokio::sync::Mutex<()>,
    /// showing -> viewer -> scope -> handle id
    viewers: Mutex<BTreeMap<String, HashMap<String, HashMap<u64, u64>>>>,
    next_handle: AtomicU64,
    next_scope: AtomicU64,
}

/// Scope used by `subscribe`. Sessions take their own from `new_scope`.
pub const DEFAULT_SCOPE: u64 = 0;

impl PresenceChannel {
    pub fn new(broker: Arc<dyn Broker>, router: TopicRouter, config: &BrokerConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            broker,
            router,
            retry: RetryPolicy::from_config(config),
            connect_timeout: config.connect_timeout(),
            state,
            connect_lock: tokio::sync::Mutex::new(()),
            viewers: Mutex::new(BTreeMap::new()),
            next_handle: AtomicU64::new(1),
            next_scope: AtomicU64::new(DEFAULT_SCOPE + 1),
        }
    }

    pub fn router(&self) -> &TopicRouter {
        &self.router
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe connectivity changes.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!("broker connection is now {:?}", next);
        }
    }

    /// Report a dropped transport. The next operation reconnects.
    pub fn mark_disconnected(&self) {
        if self.state() != ConnectionState::Disconnected {
            warn!("broker connection lost");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Connect if needed, retrying with exponential backoff until the
    /// connect timeout runs out. Concurrent callers share one attempt.
    pub async fn ensure_connected(&self) -> Result<()> {
        if self.state() == ConnectionState::Connected && self.broker.is_connected() {
            return Ok(());
        }

        let _guard = self.connect_lock.lock().await;
        if self.state() == ConnectionState::Connected && self.broker.is_connected() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        let attempts = async {
            let mut delays = self.retry.delays();
            let mut attempt = 1u32;
            loop {
                match self.broker.connect().await {
                    Ok(()) => return attempt,
                    Err(e) => {
                        let delay = delays.next().unwrap_or(self.retry.max);
                        warn!("broker connect attempt {} failed: {}, retrying in {:?}", attempt, e, delay);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                }
            }
        };

        match tokio::time::timeout(self.connect_timeout, attempts).await {
            Ok(attempt) => {
                self.set_state(ConnectionState::Connected);
                info!("Broker connected after {} attempt(s)", attempt);
                Ok(())
            }
            Err(_) => {
                self.set_state(ConnectionState::Disconnected);
                warn!("Giving up on broker connection after {:?}", self.connect_timeout);
                Err(CoordinatorError::ConnectionTimeout(self.connect_timeout))
            }
        }
    }

    /// Open a raw subscription, reconnecting first if the transport is down.
    pub async fn open(&self, topic: &str) -> Result<Subscription> {
        let deadline = tokio::time::Instant::now() + self.connect_timeout;
        let mut delays = self.retry.delays();
        loop {
            self.ensure_connected().await?;
            match self.broker.subscribe(topic).await {
                Ok(sub) => return Ok(sub),
                Err(e) if e.is_transient() => {
                    self.mark_disconnected();
                    if tokio::time::Instant::now() >= deadline {
                        return Err(CoordinatorError::ConnectionTimeout(self.connect_timeout));
                    }
                    let delay = delays.next().unwrap_or(self.retry.max);
                    warn!("subscribe to {} failed: {}, retrying in {:?}", topic, e, delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Publish once, reconnecting first. A transport failure marks the
    /// channel disconnected before the error is returned.
    pub async fn publish_json<T: Serialize + ?Sized>(&self, topic: &str, message: &T) -> Result<()> {
        self.ensure_connected().await?;
        let result = crate::broker::publish_json(self.broker.as_ref(), topic, message).await;
        if let Err(e) = &result {
            if e.is_transient() {
                self.mark_disconnected();
            }
        }
        result
    }

    /// A fresh registration scope, distinct from every other one handed out
    /// by this channel.
    pub fn new_scope(&self) -> u64 {
        self.next_scope.fetch_add(1, Ordering::Relaxed)
    }

    fn registered(&self, scope: u64, viewer_id: &str, showing_id: &str) -> Option<u64> {
        let viewers = self.viewers.lock().unwrap_or_else(|e| e.into_inner());
        viewers
            .get(showing_id)
            .and_then(|v| v.get(viewer_id))
            .and_then(|scopes| scopes.get(&scope))
            .copied()
    }

    /// Start listening to a showing's seat updates on behalf of a viewer.
    /// Subscribing twice returns the existing handle and no new stream.
    pub async fn subscribe(&self, viewer_id: &str, showing_id: &str) -> Result<Attached> {
        self.subscribe_in(DEFAULT_SCOPE, viewer_id, showing_id).await
    }

    /// `subscribe` within one scope. Other scopes of the same viewer keep
    /// their own registrations and streams.
    pub async fn subscribe_in(&self, scope: u64, viewer_id: &str, showing_id: &str) -> Result<Attached> {
        if viewer_id.is_empty() {
            return Err(CoordinatorError::InvalidArgument("viewer id must not be empty".into()));
        }
        let topic = self.router.seats_topic(showing_id)?;
        let handle = |id| PresenceHandle {
            id,
            scope,
            viewer_id: viewer_id.to_string(),
            showing_id: showing_id.to_string(),
            topic: topic.clone(),
        };

        if let Some(id) = self.registered(scope, viewer_id, showing_id) {
            debug!("{} already subscribed to {} (scope {})", viewer_id, showing_id, scope);
            return Ok(Attached {
                handle: handle(id),
                stream: None,
            });
        }

        let stream = self.open(&topic).await?;

        let mut viewers = self.viewers.lock().unwrap_or_else(|e| e.into_inner());
        let showing = viewers.entry(showing_id.to_string()).or_default();
        let scopes = showing.entry(viewer_id.to_string()).or_default();
        if let Some(&id) = scopes.get(&scope) {
            // lost a race with a concurrent subscribe, keep theirs
            return Ok(Attached {
                handle: handle(id),
                stream: None,
            });
        }
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        scopes.insert(scope, id);
        info!("Viewer {} subscribed to showing {} ({} watching)", viewer_id, showing_id, showing.len());

        Ok(Attached {
            handle: handle(id),
            stream: Some(stream),
        })
    }

    /// Re-open the stream behind a still-registered handle after the
    /// transport dropped it.
    pub async fn resubscribe(&self, handle: &PresenceHandle) -> Result<Subscription> {
        if self.registered(handle.scope, &handle.viewer_id, &handle.showing_id) != Some(handle.id) {
            return Err(CoordinatorError::InvalidArgument(format!(
                "{} is no longer subscribed to {}",
                handle.viewer_id, handle.showing_id
            )));
        }
        self.open(&handle.topic).await
    }

    /// Release a registration. Returns false if it was already released.
    pub fn unsubscribe(&self, handle: &PresenceHandle) -> bool {
        let mut viewers = self.viewers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(showing) = viewers.get_mut(&handle.showing_id) else {
            return false;
        };
        let Some(scopes) = showing.get_mut(&handle.viewer_id) else {
            return false;
        };
        if scopes.get(&handle.scope) != Some(&handle.id) {
            return false;
        }
        scopes.remove(&handle.scope);
        if !scopes.is_empty() {
            debug!(
                "Viewer {} closed one of {} sessions on showing {}",
                handle.viewer_id,
                scopes.len() + 1,
                handle.showing_id
            );
            return true;
        }
        showing.remove(&handle.viewer_id);
        info!("Viewer {} left showing {}", handle.viewer_id, handle.showing_id);
        if showing.is_empty() {
            viewers.remove(&handle.showing_id);
            info!("🧹 No viewers left on showing {}", handle.showing_id);
        }
        true
    }

    pub fn viewer_count(&self, showing_id: &str) -> usize {
        let viewers = self.viewers.lock().unwrap_or_else(|e| e.into_inner());
        viewers.get(showing_id).map(|v| v.len()).unwrap_or(0)
    }

    pub fn active_showings(&self) -> Vec<String> {
        let viewers = self.viewers.lock().unwrap_or_else(|e| e.into_inner());
        viewers.keys().cloned().collect()
    }
}

impl std::fmt::Debug for PresenceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceChannel")
            .field("namespace", &self.router.namespace())
            .field("state", &self.state())
            .finish()
    }
}
