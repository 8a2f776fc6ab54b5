use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Seat identity inside a room: row letter(s) plus seat number, e.g. `A1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SeatId {
    pub row: String,
    pub number: u32,
}

impl SeatId {
    pub fn new(row: impl Into<String>, number: u32) -> Self {
        Self { row: row.into(), number }
    }
}

impl fmt::Display for SeatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.row, self.number)
    }
}

impl FromStr for SeatId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let split = s
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(|| format!("seat id '{}' has no seat number", s))?;
        let (row, number) = s.split_at(split);

        if row.is_empty() || !row.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(format!("seat id '{}' has an invalid row", s));
        }
        let number: u32 = number
            .parse()
            .map_err(|_| format!("seat id '{}' has an invalid seat number", s))?;
        if number == 0 {
            return Err(format!("seat id '{}' has seat number 0", s));
        }

        Ok(SeatId::new(row.to_ascii_uppercase(), number))
    }
}

impl TryFrom<String> for SeatId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SeatId> for String {
    fn from(id: SeatId) -> Self {
        id.to_string()
    }
}

/// Seat status from the point of view of one viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SeatStatus {
    Available,
    HeldBySelf,
    HeldByOther,
    Booked,
}

impl SeatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeatStatus::Available => "available",
            SeatStatus::HeldBySelf => "held-by-self",
            SeatStatus::HeldByOther => "held-by-other",
            SeatStatus::Booked => "booked",
        }
    }
}

/// Perspective-free seat state as the arbiter broadcasts it.
/// `Held` is resolved to self/other by each consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeatState {
    Available,
    Held,
    Booked,
}

impl SeatState {
    /// Resolve against the local viewer. `owner` is the holder or booker, if any.
    pub fn for_viewer(&self, owner: Option<&str>, viewer_id: &str) -> SeatStatus {
        match self {
            SeatState::Available => SeatStatus::Available,
            SeatState::Booked => SeatStatus::Booked,
            SeatState::Held if owner == Some(viewer_id) => SeatStatus::HeldBySelf,
            SeatState::Held => SeatStatus::HeldByOther,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Seat {
    pub id: SeatId,
    pub accessible: bool,
    /// Price in minor currency units.
    pub price: i64,
    pub status: SeatStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_row_and_number() {
        let id: SeatId = "A12".parse().unwrap();
        assert_eq!(id, SeatId::new("A", 12));
        assert_eq!(id.to_string(), "A12");

        let lower: SeatId = "h2".parse().unwrap();
        assert_eq!(lower, SeatId::new("H", 2));
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!("".parse::<SeatId>().is_err());
        assert!("A".parse::<SeatId>().is_err());
        assert!("12".parse::<SeatId>().is_err());
        assert!("A0".parse::<SeatId>().is_err());
        assert!("A1x".parse::<SeatId>().is_err());
    }

    #[test]
    fn seat_id_is_a_plain_string_on_the_wire() {
        let json = serde_json::to_string(&SeatId::new("B", 7)).unwrap();
        assert_eq!(json, "\"B7\"");
        let back: SeatId = serde_json::from_str("\"B7\"").unwrap();
        assert_eq!(back, SeatId::new("B", 7));
    }

    #[test]
    fn held_resolves_relative_to_viewer() {
        assert_eq!(SeatState::Held.for_viewer(Some("v1"), "v1"), SeatStatus::HeldBySelf);
        assert_eq!(SeatState::Held.for_viewer(Some("v2"), "v1"), SeatStatus::HeldByOther);
        assert_eq!(SeatState::Booked.for_viewer(Some("v1"), "v1"), SeatStatus::Booked);
        assert_eq!(SeatState::Available.for_viewer(None, "v1"), SeatStatus::Available);
    }
}
