pub mod broker;
pub mod config;
pub mod controllers;
pub mod database;
pub mod error;
pub mod layout_client;
pub mod models;
pub mod presence;
pub mod redis_client;
pub mod seat_map;
pub mod services;
pub mod session;
pub mod store;
pub mod synchronizer;
pub mod topics;

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use broker::{Broker, RedisBroker};
use layout_client::{HttpLayoutClient, LayoutSource, StaticLayouts};
use services::BookingArbiter;
use store::PgBookingStore;
use topics::TopicRouter;

pub use error::CoordinatorError;

// Shared state of the arbiter service
#[derive(Clone)]
pub struct AppState {
    pub arbiter: Arc<BookingArbiter>,
    pub broker: Arc<dyn Broker>,
    /// Absent when the arbiter runs over an in-memory store.
    pub db: Option<database::Database>,
}

impl AppState {
    pub fn with_arbiter(arbiter: Arc<BookingArbiter>, broker: Arc<dyn Broker>) -> Arc<Self> {
        Arc::new(Self {
            arbiter,
            broker,
            db: None,
        })
    }

    /// Broker connected and, if there is one, the database answering.
    pub async fn healthy(&self) -> bool {
        if !self.broker.is_connected() {
            return false;
        }
        match &self.db {
            Some(db) => db.ping().await,
            None => true,
        }
    }

    /// Wire up PostgreSQL, the Redis broker and the layout source from
    /// configuration.
    pub async fn new(config: &config::Config) -> anyhow::Result<Arc<Self>> {
        let db = database::Database::connect(&config.database).await?;
        db.run_migrations().await?;

        let store = Arc::new(PgBookingStore::new(&db));
        let broker: Arc<dyn Broker> = Arc::new(RedisBroker::new(&config.redis.url, config.broker.channel_buffer));

        let layouts: Arc<dyn LayoutSource> = match &config.layout.base_url {
            Some(url) => {
                info!("Room layouts from {}", url);
                Arc::new(HttpLayoutClient::new(url, Duration::from_secs(config.layout.timeout_secs))?)
            }
            None => {
                info!("No LAYOUT_API_URL set, every showing uses the standard room");
                Arc::new(StaticLayouts::with_standard_fallback())
            }
        };

        let arbiter = Arc::new(BookingArbiter::new(
            broker.clone(),
            store,
            layouts,
            TopicRouter::new(config.broker.namespace.clone())?,
            &config.broker,
            &config.booking,
        ));

        Ok(Arc::new(Self {
            arbiter,
            broker,
            db: Some(db),
        }))
    }
}
