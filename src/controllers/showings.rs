use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::sync::Arc;

use super::into_http;
use crate::error::CoordinatorError;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/showings/{showing_id}/seats", get(get_seats))
}

/* ---------- SEATS ---------- */

// GET /api/showings/{showing_id}/seats
async fn get_seats(
    State(state): State<Arc<AppState>>,
    Path(showing_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    match state.arbiter.snapshot(&showing_id).await {
        Ok(snapshot) => Ok(Json(snapshot)),
        Err(CoordinatorError::InvalidRequest(msg)) => Err((StatusCode::NOT_FOUND, msg)),
        Err(e) => Err(into_http(e)),
    }
}
