pub mod bookings;
pub mod showings;

use axum::{http::StatusCode, Router};
use std::sync::Arc;
use tracing::error;

use crate::error::CoordinatorError;

pub fn routes() -> Router<Arc<crate::AppState>> {
    Router::new()
        .merge(showings::routes())
        .merge(bookings::routes())
}

/* ---------- helpers ---------- */

/// Map a coordinator error onto the handler error shape.
pub(crate) fn into_http(err: CoordinatorError) -> (StatusCode, String) {
    let status = match &err {
        CoordinatorError::InvalidArgument(_)
        | CoordinatorError::InvalidRequest(_)
        | CoordinatorError::UnknownSeat(_)
        | CoordinatorError::Codec(_) => StatusCode::BAD_REQUEST,
        CoordinatorError::SeatUnavailable(_) | CoordinatorError::SeatTaken(_) => StatusCode::CONFLICT,
        CoordinatorError::ConnectionError(_)
        | CoordinatorError::ConnectionTimeout(_)
        | CoordinatorError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoordinatorError::BookingTimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
        CoordinatorError::SessionClosed => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("request failed: {}", err);
    }
    (status, err.to_string())
}
