#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use seat_coordinator::broker::{Broker, MemoryBroker, RetryPolicy};
use seat_coordinator::config::{BookingConfig, BrokerConfig};
use seat_coordinator::layout_client::StaticLayouts;
use seat_coordinator::models::{RoomLayout, SeatId, SeatStatus};
use seat_coordinator::presence::PresenceChannel;
use seat_coordinator::services::BookingArbiter;
use seat_coordinator::session::{SessionOptions, ViewerSession};
use seat_coordinator::store::MemoryBookingStore;
use seat_coordinator::topics::TopicRouter;

pub const NS: &str = "cinema";

pub fn seat(id: &str) -> SeatId {
    id.parse().unwrap()
}

pub fn fast_broker_config() -> BrokerConfig {
    BrokerConfig {
        namespace: NS.to_string(),
        connect_timeout_ms: 300,
        retry_initial_ms: 5,
        retry_max_ms: 25,
        publish_attempts: 5,
        channel_buffer: 256,
    }
}

pub struct Harness {
    pub broker: Arc<MemoryBroker>,
    pub store: Arc<MemoryBookingStore>,
    pub layouts: Arc<StaticLayouts>,
    pub arbiter: Arc<BookingArbiter>,
    pub presence: Arc<PresenceChannel>,
    arbiter_task: Option<JoinHandle<()>>,
}

impl Harness {
    /// Arbiter and presence over one in-memory broker. Showing `S1` has the
    /// standard room; any other showing is unknown. Sessions seed their seat
    /// maps from the arbiter's snapshot.
    pub async fn new() -> Self {
        Self::with_hold_ttl(BookingConfig::default().hold_ttl()).await
    }

    pub async fn with_hold_ttl(hold_ttl: Duration) -> Self {
        let broker = Arc::new(MemoryBroker::default());
        broker.connect().await.unwrap();

        let store = Arc::new(MemoryBookingStore::new());
        let layouts = Arc::new(StaticLayouts::new().with(RoomLayout::standard("S1")));
        let config = fast_broker_config();
        let router = TopicRouter::new(NS).unwrap();

        let arbiter = Arc::new(
            BookingArbiter::new(
                broker.clone(),
                store.clone(),
                layouts.clone(),
                router.clone(),
                &config,
                &BookingConfig::default(),
            )
            .with_retry(RetryPolicy::new(5, Duration::from_millis(2), Duration::from_millis(10)))
            .with_hold_ttl(hold_ttl),
        );
        let presence = Arc::new(PresenceChannel::new(broker.clone(), router, &config));

        Self {
            broker,
            store,
            layouts,
            arbiter,
            presence,
            arbiter_task: None,
        }
    }

    pub async fn with_arbiter_running() -> Self {
        let mut harness = Self::new().await;
        harness.start_arbiter().await;
        harness
    }

    pub async fn start_arbiter(&mut self) {
        let task = self.arbiter.clone().start().await.unwrap();
        self.arbiter_task = Some(task);
    }

    pub async fn session(&self, viewer: &str) -> ViewerSession {
        self.session_with_timeout(viewer, Duration::from_secs(2)).await
    }

    pub async fn session_with_timeout(&self, viewer: &str, outcome_timeout: Duration) -> ViewerSession {
        ViewerSession::connect(
            viewer,
            self.presence.clone(),
            self.arbiter.clone(),
            SessionOptions {
                outcome_timeout,
                channel_buffer: 256,
            },
        )
        .await
        .unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some(task) = self.arbiter_task.take() {
            task.abort();
        }
    }
}

/// Poll `check` until it returns true, failing the test after two seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

pub async fn wait_for_status(session: &ViewerSession, showing: &str, seat_id: &SeatId, status: SeatStatus) {
    eventually(&format!("{} to become {:?}", seat_id, status), || async move {
        session
            .snapshot(showing)
            .await
            .unwrap()
            .and_then(|snap| snap.status_of(seat_id))
            == Some(status)
    })
    .await;
}
