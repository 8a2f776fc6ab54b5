use thiserror::Error;

use crate::models::SeatId;

/// Errors raised by the seat coordinator.
///
/// Booking rejections are not errors: they travel as a `BookingOutcome`.
/// The variants here cover what a caller can observe on the way there.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Broker unreachable. Recovered by reconnecting, never fatal.
    #[error("broker connection error: {0}")]
    ConnectionError(String),

    #[error("timed out after {0:?} waiting for broker connection")]
    ConnectionTimeout(std::time::Duration),

    #[error("seat {0} is not available")]
    SeatUnavailable(SeatId),

    #[error("seat {0} does not exist in this showing")]
    UnknownSeat(SeatId),

    #[error("invalid booking request: {0}")]
    InvalidRequest(String),

    #[error("seat {0} was taken by another viewer")]
    SeatTaken(SeatId),

    /// Client-side only. The arbiter may still settle the request later.
    #[error("booking {0} timed out waiting for an outcome")]
    BookingTimedOut(String),

    #[error("booking store error: {0}")]
    Store(String),

    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("session is closed")]
    SessionClosed,
}

impl From<sqlx::Error> for CoordinatorError {
    fn from(err: sqlx::Error) -> Self {
        CoordinatorError::Store(err.to_string())
    }
}

impl From<redis::RedisError> for CoordinatorError {
    fn from(err: redis::RedisError) -> Self {
        CoordinatorError::ConnectionError(err.to_string())
    }
}

impl CoordinatorError {
    /// Transport-level failures that a retry with backoff can cure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoordinatorError::ConnectionError(_) | CoordinatorError::ConnectionTimeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
