use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use super::into_http;
use crate::models::{BookingRequest, SeatId};
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/bookings", post(create_booking))
        .route("/bookings/{request_id}", get(get_booking))
}

/* ---------- BOOKINGS ---------- */

// POST /api/bookings
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBookingRequest {
    /// Client-chosen idempotency key; generated when absent.
    request_id: Option<String>,
    viewer_id: String,
    showing_id: String,
    seat_ids: Vec<String>,
}

async fn create_booking(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateBookingRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if req.viewer_id.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "viewerId must not be empty".to_string()));
    }

    let seat_ids = req
        .seat_ids
        .iter()
        .map(|s| s.parse::<SeatId>())
        .collect::<Result<_, _>>()
        .map_err(|e| (StatusCode::BAD_REQUEST, e))?;

    let request = BookingRequest {
        request_id: req.request_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        viewer_id: req.viewer_id,
        showing_id: req.showing_id,
        seat_ids,
        submitted_at: Utc::now(),
    };

    let outcome = state.arbiter.process_request(&request).await.map_err(into_http)?;
    let status = if outcome.accepted {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)))
}

// GET /api/bookings/{request_id}
async fn get_booking(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    match state.arbiter.outcome(&request_id).await.map_err(into_http)? {
        Some(outcome) => Ok(Json(outcome)),
        None => Err((StatusCode::NOT_FOUND, format!("no booking with request id '{}'", request_id))),
    }
}
