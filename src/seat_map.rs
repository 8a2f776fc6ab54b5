//! Per-showing seat grid as one viewer sees it.
//!
//! Every seat carries two layers: the authoritative state last broadcast by
//! the arbiter, and the viewer's own optimistic selection. The visible status
//! is derived from both; authoritative `booked` or `held` by someone else
//! always wins and drops the local selection.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::{CoordinatorError, Result};
use crate::models::{RoomLayout, Seat, SeatId, SeatState, SeatStatus, SeatUpdate};

#[derive(Debug, Clone)]
struct SeatEntry {
    accessible: bool,
    price: i64,
    authoritative: SeatState,
    /// Holder or booker according to the last applied update.
    owner: Option<String>,
    /// Timestamp of the last applied update, `None` until the first one.
    last_applied: Option<i64>,
    selected: bool,
}

impl SeatEntry {
    fn status(&self, viewer_id: &str) -> SeatStatus {
        match self.authoritative.for_viewer(self.owner.as_deref(), viewer_id) {
            SeatStatus::Booked => SeatStatus::Booked,
            SeatStatus::HeldByOther => SeatStatus::HeldByOther,
            SeatStatus::Available | SeatStatus::HeldBySelf if self.selected => SeatStatus::HeldBySelf,
            SeatStatus::Available | SeatStatus::HeldBySelf => SeatStatus::Available,
        }
    }
}

/// What `apply_seat_update` did with an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResult {
    /// Merged. `overridden` is set when a local selection lost to it.
    Applied { status: SeatStatus, overridden: bool },
    /// Not newer than what was already applied for this seat.
    Stale,
    /// Seat is not part of this room.
    UnknownSeat,
    /// Update belongs to another showing.
    OtherShowing,
}

/// Read-only view handed to renderers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatMapSnapshot {
    pub showing_id: String,
    pub seats: Vec<Seat>,
    pub available: usize,
    pub held_by_self: usize,
    pub held_by_other: usize,
    pub booked: usize,
}

impl SeatMapSnapshot {
    pub fn status_of(&self, id: &SeatId) -> Option<SeatStatus> {
        self.seats.iter().find(|s| &s.id == id).map(|s| s.status)
    }

    pub fn capacity(&self) -> usize {
        self.seats.len()
    }
}

#[derive(Debug, Clone)]
pub struct SeatMap {
    showing_id: String,
    viewer_id: String,
    seats: BTreeMap<SeatId, SeatEntry>,
}

impl SeatMap {
    /// Seed from a layout. Holder and timestamp are taken over when the
    /// layout carries them, so broadcasts already reflected in it are stale.
    /// A seat this viewer already holds starts out selected.
    pub fn new(viewer_id: impl Into<String>, layout: &RoomLayout) -> Self {
        let viewer_id = viewer_id.into();
        let seats = layout
            .seats
            .iter()
            .map(|spec| {
                let own_hold = spec.state == SeatState::Held && spec.holder.as_deref() == Some(viewer_id.as_str());
                (
                    spec.id.clone(),
                    SeatEntry {
                        accessible: spec.accessible,
                        price: spec.price,
                        authoritative: spec.state,
                        owner: spec.holder.clone(),
                        last_applied: spec.updated_at,
                        selected: own_hold,
                    },
                )
            })
            .collect();

        Self {
            showing_id: layout.showing_id.clone(),
            viewer_id,
            seats,
        }
    }

    pub fn showing_id(&self) -> &str {
        &self.showing_id
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    pub fn status(&self, id: &SeatId) -> Option<SeatStatus> {
        self.seats.get(id).map(|e| e.status(&self.viewer_id))
    }

    /// Flip a seat between available and held-by-self. Returns the new status.
    /// Booked or held-by-other seats are refused without any change.
    pub fn toggle(&mut self, id: &SeatId) -> Result<SeatStatus> {
        let viewer_id = self.viewer_id.as_str();
        let entry = self
            .seats
            .get_mut(id)
            .ok_or_else(|| CoordinatorError::UnknownSeat(id.clone()))?;

        match entry.status(viewer_id) {
            SeatStatus::Booked | SeatStatus::HeldByOther => {
                Err(CoordinatorError::SeatUnavailable(id.clone()))
            }
            SeatStatus::Available => {
                entry.selected = true;
                Ok(SeatStatus::HeldBySelf)
            }
            SeatStatus::HeldBySelf => {
                entry.selected = false;
                Ok(SeatStatus::Available)
            }
        }
    }

    /// Merge one broadcast update. Last write wins per seat; anything not
    /// newer than the last applied timestamp for that seat is dropped.
    pub fn apply_seat_update(&mut self, update: &SeatUpdate) -> ApplyResult {
        if update.showing_id != self.showing_id {
            return ApplyResult::OtherShowing;
        }
        let viewer_id = self.viewer_id.as_str();
        let Some(entry) = self.seats.get_mut(&update.seat_id) else {
            return ApplyResult::UnknownSeat;
        };

        if let Some(last) = entry.last_applied {
            if update.timestamp <= last {
                debug!(
                    "Dropping stale update for {} ({} <= {})",
                    update.seat_id, update.timestamp, last
                );
                return ApplyResult::Stale;
            }
        }

        entry.authoritative = update.status;
        entry.owner = update.viewer_id.clone();
        entry.last_applied = Some(update.timestamp);

        let authoritative = update.status.for_viewer(update.viewer_id.as_deref(), viewer_id);
        let lost = matches!(authoritative, SeatStatus::Booked | SeatStatus::HeldByOther);
        let overridden = lost && entry.selected;
        if lost {
            entry.selected = false;
        }

        ApplyResult::Applied {
            status: entry.status(viewer_id),
            overridden,
        }
    }

    /// Seats the viewer currently holds locally.
    pub fn selection(&self) -> BTreeSet<SeatId> {
        let viewer_id = self.viewer_id.as_str();
        self.seats
            .iter()
            .filter(|(_, e)| e.status(viewer_id) == SeatStatus::HeldBySelf)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Drop every local selection, returning the seats that were selected.
    pub fn release_all(&mut self) -> Vec<SeatId> {
        let released = self.selection();
        for id in &released {
            if let Some(entry) = self.seats.get_mut(id) {
                entry.selected = false;
            }
        }
        released.into_iter().collect()
    }

    pub fn snapshot(&self) -> SeatMapSnapshot {
        let viewer_id = self.viewer_id.as_str();
        let mut snapshot = SeatMapSnapshot {
            showing_id: self.showing_id.clone(),
            seats: Vec::with_capacity(self.seats.len()),
            available: 0,
            held_by_self: 0,
            held_by_other: 0,
            booked: 0,
        };

        for (id, entry) in &self.seats {
            let status = entry.status(viewer_id);
            match status {
                SeatStatus::Available => snapshot.available += 1,
                SeatStatus::HeldBySelf => snapshot.held_by_self += 1,
                SeatStatus::HeldByOther => snapshot.held_by_other += 1,
                SeatStatus::Booked => snapshot.booked += 1,
            }
            snapshot.seats.push(Seat {
                id: id.clone(),
                accessible: entry.accessible,
                price: entry.price,
                status,
            });
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn a(n: u32) -> SeatId {
        SeatId::new("A", n)
    }

    fn map_for(viewer: &str) -> SeatMap {
        SeatMap::new(viewer, &RoomLayout::with_seats("S1", [a(1), a(2)]))
    }

    fn update(seat: SeatId, status: SeatState, owner: Option<&str>, ts: i64) -> SeatUpdate {
        SeatUpdate::new("S1", seat, status, owner.map(str::to_string), ts)
    }

    #[test]
    fn toggle_flips_between_available_and_held_by_self() {
        let mut map = map_for("v1");
        assert_eq!(map.toggle(&a(1)).unwrap(), SeatStatus::HeldBySelf);
        assert_eq!(map.status(&a(1)), Some(SeatStatus::HeldBySelf));
        assert_eq!(map.toggle(&a(1)).unwrap(), SeatStatus::Available);
        assert_eq!(map.status(&a(1)), Some(SeatStatus::Available));
    }

    #[test]
    fn toggle_refuses_booked_and_held_by_other_without_mutation() {
        let mut map = map_for("v1");
        map.apply_seat_update(&update(a(1), SeatState::Booked, Some("v2"), 10));
        map.apply_seat_update(&update(a(2), SeatState::Held, Some("v2"), 11));

        let before = map.snapshot();
        assert!(matches!(map.toggle(&a(1)), Err(CoordinatorError::SeatUnavailable(_))));
        assert!(matches!(map.toggle(&a(2)), Err(CoordinatorError::SeatUnavailable(_))));
        assert_eq!(map.snapshot(), before);
    }

    #[test]
    fn toggle_of_unknown_seat_is_an_error() {
        let mut map = map_for("v1");
        assert!(matches!(map.toggle(&a(9)), Err(CoordinatorError::UnknownSeat(_))));
    }

    #[test]
    fn seeded_state_is_authoritative_and_older_broadcasts_are_stale() {
        let mut layout = RoomLayout::with_seats("S1", [a(1), a(2), a(3)]);
        layout.seats[0].state = SeatState::Booked;
        layout.seats[0].holder = Some("v9".into());
        layout.seats[0].updated_at = Some(20);
        layout.seats[1].state = SeatState::Held;
        layout.seats[1].holder = Some("v1".into());
        layout.seats[1].updated_at = Some(21);
        let mut map = SeatMap::new("v1", &layout);

        assert_eq!(map.status(&a(1)), Some(SeatStatus::Booked));
        assert_eq!(map.status(&a(2)), Some(SeatStatus::HeldBySelf));
        assert_eq!(map.selection().into_iter().collect::<Vec<_>>(), vec![a(2)]);
        assert!(matches!(map.toggle(&a(1)), Err(CoordinatorError::SeatUnavailable(_))));

        // a hold broadcast that predates the booking arrives late
        let late = update(a(1), SeatState::Held, Some("v9"), 15);
        assert_eq!(map.apply_seat_update(&late), ApplyResult::Stale);
        assert_eq!(map.status(&a(1)), Some(SeatStatus::Booked));
    }

    #[test]
    fn authoritative_booking_overrides_local_hold() {
        let mut map = map_for("vA");
        map.toggle(&a(1)).unwrap();

        let result = map.apply_seat_update(&update(a(1), SeatState::Booked, Some("vB"), 5));
        assert_eq!(
            result,
            ApplyResult::Applied {
                status: SeatStatus::Booked,
                overridden: true
            }
        );
        assert_eq!(map.status(&a(1)), Some(SeatStatus::Booked));
        assert!(map.selection().is_empty());
    }

    #[test]
    fn hold_by_other_overrides_and_does_not_come_back() {
        let mut map = map_for("vA");
        map.toggle(&a(1)).unwrap();
        map.apply_seat_update(&update(a(1), SeatState::Held, Some("vB"), 5));
        assert_eq!(map.status(&a(1)), Some(SeatStatus::HeldByOther));

        // the other viewer lets go; our old selection stays dropped
        map.apply_seat_update(&update(a(1), SeatState::Available, None, 6));
        assert_eq!(map.status(&a(1)), Some(SeatStatus::Available));
    }

    #[test]
    fn own_hold_echo_keeps_held_by_self() {
        let mut map = map_for("vA");
        map.toggle(&a(1)).unwrap();
        let result = map.apply_seat_update(&update(a(1), SeatState::Held, Some("vA"), 5));
        assert_eq!(
            result,
            ApplyResult::Applied {
                status: SeatStatus::HeldBySelf,
                overridden: false
            }
        );
    }

    #[test]
    fn stale_and_duplicate_updates_are_dropped() {
        let mut map = map_for("v1");
        map.apply_seat_update(&update(a(1), SeatState::Booked, Some("v2"), 10));

        assert_eq!(
            map.apply_seat_update(&update(a(1), SeatState::Available, None, 9)),
            ApplyResult::Stale
        );
        assert_eq!(
            map.apply_seat_update(&update(a(1), SeatState::Available, None, 10)),
            ApplyResult::Stale
        );
        assert_eq!(map.status(&a(1)), Some(SeatStatus::Booked));
    }

    #[test]
    fn ordering_is_per_seat_not_global() {
        let mut map = map_for("v1");
        map.apply_seat_update(&update(a(1), SeatState::Held, Some("v2"), 100));
        // older than A1's update but the first one for A2
        let result = map.apply_seat_update(&update(a(2), SeatState::Booked, Some("v3"), 50));
        assert!(matches!(result, ApplyResult::Applied { .. }));
        assert_eq!(map.status(&a(2)), Some(SeatStatus::Booked));
    }

    #[test]
    fn updates_for_other_showings_or_seats_are_ignored() {
        let mut map = map_for("v1");
        let mut other = update(a(1), SeatState::Booked, Some("v2"), 1);
        other.showing_id = "S2".into();
        assert_eq!(map.apply_seat_update(&other), ApplyResult::OtherShowing);
        assert_eq!(
            map.apply_seat_update(&update(a(7), SeatState::Booked, None, 1)),
            ApplyResult::UnknownSeat
        );
    }

    #[test]
    fn snapshot_counts_statuses() {
        let mut map = SeatMap::new("v1", &RoomLayout::standard("S1"));
        map.toggle(&a(1)).unwrap();
        map.apply_seat_update(&update(a(2), SeatState::Held, Some("v2"), 1));
        map.apply_seat_update(&update(a(3), SeatState::Booked, Some("v2"), 1));

        let snap = map.snapshot();
        assert_eq!(snap.capacity(), 96);
        assert_eq!(snap.held_by_self, 1);
        assert_eq!(snap.held_by_other, 1);
        assert_eq!(snap.booked, 1);
        assert_eq!(snap.available, 93);
        assert_eq!(snap.status_of(&a(1)), Some(SeatStatus::HeldBySelf));
    }

    #[test]
    fn release_all_clears_selection() {
        let mut map = map_for("v1");
        map.toggle(&a(1)).unwrap();
        map.toggle(&a(2)).unwrap();
        assert_eq!(map.release_all(), vec![a(1), a(2)]);
        assert!(map.selection().is_empty());
    }

    fn arb_state() -> impl Strategy<Value = (SeatState, Option<String>)> {
        prop_oneof![
            Just((SeatState::Available, None)),
            Just((SeatState::Held, Some("v1".to_string()))),
            Just((SeatState::Held, Some("v2".to_string()))),
            Just((SeatState::Booked, Some("v2".to_string()))),
        ]
    }

    proptest! {
        /// Whatever order updates arrive in, the seat ends up in the state
        /// carried by the newest timestamp.
        #[test]
        fn newest_timestamp_wins_regardless_of_arrival_order(
            mut updates in prop::collection::vec((arb_state(), 0i64..1_000), 1..20)
        ) {
            updates.sort_by_key(|(_, ts)| *ts);
            updates.dedup_by_key(|(_, ts)| *ts);
            let newest = updates.last().cloned().unwrap();

            let mut shuffled = updates.clone();
            shuffled.reverse();
            shuffled.rotate_left(updates.len() / 2);

            let mut map = map_for("v1");
            for ((state, owner), ts) in &shuffled {
                map.apply_seat_update(&update(a(1), *state, owner.as_deref(), *ts));
            }

            let ((state, owner), _) = newest;
            let expected = match state.for_viewer(owner.as_deref(), "v1") {
                SeatStatus::HeldBySelf => SeatStatus::Available, // not selected locally
                other => other,
            };
            prop_assert_eq!(map.status(&a(1)), Some(expected));
        }

        #[test]
        fn stale_update_never_changes_the_map(ts in 1i64..1_000, older in 0i64..1_000) {
            prop_assume!(older <= ts);
            let mut map = map_for("v1");
            map.apply_seat_update(&update(a(1), SeatState::Booked, Some("v2"), ts));
            let before = map.snapshot();
            let result = map.apply_seat_update(&update(a(1), SeatState::Available, None, older));
            prop_assert_eq!(result, ApplyResult::Stale);
            prop_assert_eq!(map.snapshot(), before);
        }
    }
}
