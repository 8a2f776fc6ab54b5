use serde::{Deserialize, Serialize};

use super::{SeatId, SeatState};

/// Broadcast on `{namespace}/showings/{showingId}/seats`.
///
/// Ordering is per seat only: consumers drop anything not newer than
/// the last update they applied for the same seat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatUpdate {
    pub showing_id: String,
    pub seat_id: SeatId,
    pub status: SeatState,
    /// Holder or booker of the seat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewer_id: Option<String>,
    /// Milliseconds since the Unix epoch, strictly increasing per seat.
    pub timestamp: i64,
}

impl SeatUpdate {
    pub fn new(
        showing_id: impl Into<String>,
        seat_id: SeatId,
        status: SeatState,
        viewer_id: Option<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            showing_id: showing_id.into(),
            seat_id,
            status,
            viewer_id,
            timestamp,
        }
    }
}
