use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;
use validator::Validate;

use super::SeatId;

/// Seat claim sent to `{namespace}/bookings/request`.
/// `request_id` is the idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BookingRequest {
    #[validate(length(min = 1, message = "requestId must not be empty"))]
    pub request_id: String,
    #[validate(length(min = 1, message = "viewerId must not be empty"))]
    pub viewer_id: String,
    #[validate(length(min = 1, message = "showingId must not be empty"))]
    pub showing_id: String,
    #[validate(length(min = 1, message = "at least one seat is required"))]
    pub seat_ids: BTreeSet<SeatId>,
    pub submitted_at: DateTime<Utc>,
}

impl BookingRequest {
    /// New request with a fresh request id.
    pub fn new(
        viewer_id: impl Into<String>,
        showing_id: impl Into<String>,
        seat_ids: impl IntoIterator<Item = SeatId>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            viewer_id: viewer_id.into(),
            showing_id: showing_id.into(),
            seat_ids: seat_ids.into_iter().collect(),
            submitted_at: Utc::now(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    SeatTaken,
    NotConnected,
    InvalidRequest,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::SeatTaken => "seat_taken",
            RejectReason::NotConnected => "not_connected",
            RejectReason::InvalidRequest => "invalid_request",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RejectReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "seat_taken" => Ok(RejectReason::SeatTaken),
            "not_connected" => Ok(RejectReason::NotConnected),
            "invalid_request" => Ok(RejectReason::InvalidRequest),
            other => Err(format!("unknown reject reason '{}'", other)),
        }
    }
}

/// Terminal result for one request id, published on
/// `{namespace}/bookings/response/{viewerId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingOutcome {
    pub request_id: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

impl BookingOutcome {
    pub fn accepted(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            accepted: true,
            reason: None,
        }
    }

    pub fn rejected(request_id: impl Into<String>, reason: RejectReason) -> Self {
        Self {
            request_id: request_id.into(),
            accepted: false,
            reason: Some(reason),
        }
    }
}

/// Announces a local toggle so the arbiter can show the seat as held to
/// everyone else. Holds are not durable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldIntent {
    pub showing_id: String,
    pub viewer_id: String,
    pub seat_id: SeatId,
    pub held: bool,
}
