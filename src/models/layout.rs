use serde::{Deserialize, Serialize};

use super::{SeatId, SeatState};

pub const STANDARD_ROWS: [&str; 8] = ["A", "B", "C", "D", "E", "F", "G", "H"];
pub const STANDARD_SEATS_PER_ROW: u32 = 12;
pub const STANDARD_PRICE: i64 = 1200;
pub const ACCESSIBLE_PRICE: i64 = 1500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatSpec {
    pub id: SeatId,
    pub accessible: bool,
    /// Price in minor currency units.
    pub price: i64,
    /// Status known at bootstrap time.
    pub state: SeatState,
    /// Holder or booker, when the source knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
    /// Timestamp of the last authoritative change to this seat. Broadcasts
    /// not newer than this are already reflected in `state`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

/// Seat layout of the room a showing plays in. Read once to seed seat maps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomLayout {
    pub showing_id: String,
    pub seats: Vec<SeatSpec>,
}

impl RoomLayout {
    pub fn new(showing_id: impl Into<String>, seats: Vec<SeatSpec>) -> Self {
        Self {
            showing_id: showing_id.into(),
            seats,
        }
    }

    /// Rows A-H with 12 seats each. H1 and H2 are wheelchair accessible
    /// and priced higher.
    pub fn standard(showing_id: impl Into<String>) -> Self {
        let mut seats = Vec::with_capacity(STANDARD_ROWS.len() * STANDARD_SEATS_PER_ROW as usize);
        for row in STANDARD_ROWS {
            for number in 1..=STANDARD_SEATS_PER_ROW {
                let accessible = row == "H" && (number == 1 || number == 2);
                seats.push(SeatSpec {
                    id: SeatId::new(row, number),
                    accessible,
                    price: if accessible { ACCESSIBLE_PRICE } else { STANDARD_PRICE },
                    state: SeatState::Available,
                    holder: None,
                    updated_at: None,
                });
            }
        }
        Self::new(showing_id, seats)
    }

    /// Small layout with the given seats, all available at standard price.
    pub fn with_seats(showing_id: impl Into<String>, ids: impl IntoIterator<Item = SeatId>) -> Self {
        let seats = ids
            .into_iter()
            .map(|id| SeatSpec {
                id,
                accessible: false,
                price: STANDARD_PRICE,
                state: SeatState::Available,
                holder: None,
                updated_at: None,
            })
            .collect();
        Self::new(showing_id, seats)
    }

    pub fn capacity(&self) -> usize {
        self.seats.len()
    }

    pub fn contains(&self, id: &SeatId) -> bool {
        self.seats.iter().any(|s| &s.id == id)
    }
}
