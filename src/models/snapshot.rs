use serde::{Deserialize, Serialize};

use super::{RoomLayout, SeatId, SeatSpec, SeatState};

/// One seat of the authoritative snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatView {
    pub id: SeatId,
    pub accessible: bool,
    pub price: i64,
    pub status: SeatState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewer_id: Option<String>,
    /// Timestamp of the last broadcast for this seat, if there was one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Authoritative state of a showing, as served by
/// `GET /api/showings/{id}/seats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShowingSnapshot {
    pub showing_id: String,
    pub seats: Vec<SeatView>,
    pub available: usize,
    pub held: usize,
    pub booked: usize,
    pub total_capacity: usize,
}

impl ShowingSnapshot {
    pub fn seat(&self, id: &SeatId) -> Option<&SeatView> {
        self.seats.iter().find(|s| &s.id == id)
    }

    /// Seed layout for a viewer's seat map: current status, holder and the
    /// timestamp each seat was last changed at.
    pub fn into_layout(self) -> RoomLayout {
        let seats = self
            .seats
            .into_iter()
            .map(|seat| SeatSpec {
                id: seat.id,
                accessible: seat.accessible,
                price: seat.price,
                state: seat.status,
                holder: seat.viewer_id,
                updated_at: seat.timestamp,
            })
            .collect();
        RoomLayout::new(self.showing_id, seats)
    }
}
