use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use seat_coordinator::{config::Config, controllers, services::CleanupService, AppState};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    let filter = tracing_subscriber::EnvFilter::new(&config.app.rust_log);
    if config.app.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting seat coordinator ({})", config.app.environment);

    let app_state = AppState::new(&config).await?;

    // --- Start background tasks ---

    // Broker consumers; keep retrying until redis is reachable
    let arbiter = app_state.arbiter.clone();
    let retry_delay = config.broker.retry_max();
    tokio::spawn(async move {
        loop {
            match arbiter.clone().start().await {
                Ok(handle) => {
                    if let Err(e) = handle.await {
                        error!("Arbiter loop stopped: {}", e);
                    }
                    return;
                }
                Err(e) => {
                    warn!("Arbiter could not start: {}, retrying in {:?}", e, retry_delay);
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    });

    // Release expired holds
    CleanupService::new(
        app_state.arbiter.clone(),
        Duration::from_secs(config.booking.hold_sweep_interval_secs),
    )
    .spawn();

    // --- Start the web server ---

    let app = Router::new()
        .route("/", get(|| async { "Seat coordinator v1.0" }))
        .route("/health", get(health))
        .nest("/api", controllers::routes())
        .with_state(app_state.clone())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.app.host, config.app.port).parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    if state.healthy().await {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    }
}
