//! Client-side reconciliation for one viewer.
//!
//! Owns the viewer's seat maps and the lifecycle of every booking request it
//! submitted:
//!
//! ```text
//! idle -> awaiting_outcome -> settled_accepted
//!                          -> settled_rejected
//! ```
//!
//! No I/O happens here; the session feeds it broker messages and commands.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use crate::error::{CoordinatorError, Result};
use crate::models::{BookingOutcome, BookingRequest, RejectReason, RoomLayout, SeatId, SeatStatus, SeatUpdate};
use crate::seat_map::{ApplyResult, SeatMap, SeatMapSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Idle,
    AwaitingOutcome,
    SettledAccepted,
    SettledRejected,
}

impl RequestState {
    pub fn is_settled(&self) -> bool {
        matches!(self, RequestState::SettledAccepted | RequestState::SettledRejected)
    }
}

#[derive(Debug, Clone)]
struct Tracked {
    request: BookingRequest,
    state: RequestState,
    /// Waited past the client timeout at least once.
    timed_out: bool,
    outcome: Option<BookingOutcome>,
}

/// What `apply_outcome` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeEffect {
    /// First delivery for a pending request. `late` is set when the caller
    /// had already been told the request timed out.
    Settled { outcome: BookingOutcome, late: bool },
    /// Request already settled; nothing changed.
    Duplicate,
    /// No request with this id was submitted here.
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ClientSynchronizer {
    viewer_id: String,
    maps: BTreeMap<String, SeatMap>,
    requests: HashMap<String, Tracked>,
}

impl ClientSynchronizer {
    pub fn new(viewer_id: impl Into<String>) -> Self {
        Self {
            viewer_id: viewer_id.into(),
            maps: BTreeMap::new(),
            requests: HashMap::new(),
        }
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    /* ---------- seat maps ---------- */

    /// Start tracking a showing. A showing already open keeps its map.
    pub fn open(&mut self, layout: &RoomLayout) -> bool {
        if self.maps.contains_key(&layout.showing_id) {
            return false;
        }
        self.maps
            .insert(layout.showing_id.clone(), SeatMap::new(self.viewer_id.clone(), layout));
        true
    }

    /// Stop tracking a showing. Local selections on it are dropped.
    pub fn close(&mut self, showing_id: &str) -> Option<Vec<SeatId>> {
        self.maps.remove(showing_id).map(|mut map| map.release_all())
    }

    pub fn is_open(&self, showing_id: &str) -> bool {
        self.maps.contains_key(showing_id)
    }

    pub fn open_showings(&self) -> Vec<String> {
        self.maps.keys().cloned().collect()
    }

    pub fn map(&self, showing_id: &str) -> Option<&SeatMap> {
        self.maps.get(showing_id)
    }

    pub fn snapshot(&self, showing_id: &str) -> Option<SeatMapSnapshot> {
        self.maps.get(showing_id).map(SeatMap::snapshot)
    }

    pub fn toggle(&mut self, showing_id: &str, seat_id: &SeatId) -> Result<SeatStatus> {
        self.maps
            .get_mut(showing_id)
            .ok_or_else(|| CoordinatorError::InvalidArgument(format!("showing '{}' is not open", showing_id)))?
            .toggle(seat_id)
    }

    /// Merge a broadcast. Updates for closed showings are discarded.
    pub fn apply_update(&mut self, update: &SeatUpdate) -> ApplyResult {
        let Some(map) = self.maps.get_mut(&update.showing_id) else {
            return ApplyResult::OtherShowing;
        };
        let result = map.apply_seat_update(update);
        if let ApplyResult::Applied { overridden: true, status } = result {
            info!(
                "Selection of {} in showing {} lost to another viewer ({})",
                update.seat_id,
                update.showing_id,
                status.as_str()
            );
        }
        result
    }

    /* ---------- booking requests ---------- */

    /// Enter `awaiting_outcome`. Tracking the same request id again (a
    /// resubmit) keeps its current state, except that a request which never
    /// left this client (`not_connected`) goes back to waiting.
    pub fn begin(&mut self, request: BookingRequest) -> RequestState {
        if let Some(tracked) = self.requests.get_mut(&request.request_id) {
            let never_sent = tracked
                .outcome
                .as_ref()
                .is_some_and(|o| o.reason == Some(RejectReason::NotConnected));
            if never_sent {
                tracked.state = RequestState::AwaitingOutcome;
                tracked.outcome = None;
                tracked.timed_out = false;
            }
            return tracked.state;
        }

        let tracked = self
            .requests
            .entry(request.request_id.clone())
            .or_insert_with(|| Tracked {
                request,
                state: RequestState::AwaitingOutcome,
                timed_out: false,
                outcome: None,
            });
        tracked.state
    }

    pub fn state(&self, request_id: &str) -> RequestState {
        self.requests
            .get(request_id)
            .map(|t| t.state)
            .unwrap_or(RequestState::Idle)
    }

    pub fn request(&self, request_id: &str) -> Option<&BookingRequest> {
        self.requests.get(request_id).map(|t| &t.request)
    }

    pub fn outcome(&self, request_id: &str) -> Option<&BookingOutcome> {
        self.requests.get(request_id).and_then(|t| t.outcome.as_ref())
    }

    pub fn timed_out(&self, request_id: &str) -> bool {
        self.requests.get(request_id).is_some_and(|t| t.timed_out)
    }

    /// Request ids still waiting for a decision.
    pub fn pending(&self) -> Vec<String> {
        let mut pending: Vec<String> = self
            .requests
            .iter()
            .filter(|(_, t)| t.state == RequestState::AwaitingOutcome)
            .map(|(id, _)| id.clone())
            .collect();
        pending.sort();
        pending
    }

    /// Flag a pending request as past the client timeout. It stays pending
    /// so the decision is still applied when it arrives.
    pub fn mark_timed_out(&mut self, request_id: &str) -> bool {
        match self.requests.get_mut(request_id) {
            Some(t) if t.state == RequestState::AwaitingOutcome => {
                warn!("Booking {} timed out waiting for an outcome", request_id);
                t.timed_out = true;
                true
            }
            _ => false,
        }
    }

    pub fn apply_outcome(&mut self, outcome: &BookingOutcome) -> OutcomeEffect {
        let Some(tracked) = self.requests.get_mut(&outcome.request_id) else {
            debug!("Outcome for unknown request {} ignored", outcome.request_id);
            return OutcomeEffect::Unknown;
        };
        if tracked.state.is_settled() {
            debug!("Duplicate outcome for {} ignored", outcome.request_id);
            return OutcomeEffect::Duplicate;
        }

        tracked.state = if outcome.accepted {
            RequestState::SettledAccepted
        } else {
            RequestState::SettledRejected
        };
        tracked.outcome = Some(outcome.clone());
        info!(
            "Booking {} settled: accepted={} reason={}",
            outcome.request_id,
            outcome.accepted,
            outcome.reason.map(|r| r.as_str()).unwrap_or("-")
        );

        OutcomeEffect::Settled {
            outcome: outcome.clone(),
            late: tracked.timed_out,
        }
    }

    /// Settle a request that could not be sent at all.
    pub fn settle_locally(&mut self, request_id: &str, reason: RejectReason) -> OutcomeEffect {
        self.apply_outcome(&BookingOutcome::rejected(request_id, reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SeatState;
    use proptest::prelude::*;

    fn a(n: u32) -> SeatId {
        SeatId::new("A", n)
    }

    fn sync_with_s1(viewer: &str) -> ClientSynchronizer {
        let mut sync = ClientSynchronizer::new(viewer);
        sync.open(&RoomLayout::with_seats("S1", [a(1), a(2)]));
        sync
    }

    fn request(id: &str) -> BookingRequest {
        BookingRequest::new("v1", "S1", [a(1)]).with_request_id(id)
    }

    #[test]
    fn request_walks_idle_awaiting_settled() {
        let mut sync = sync_with_s1("v1");
        assert_eq!(sync.state("r1"), RequestState::Idle);

        assert_eq!(sync.begin(request("r1")), RequestState::AwaitingOutcome);
        assert_eq!(sync.pending(), vec!["r1".to_string()]);

        let effect = sync.apply_outcome(&BookingOutcome::accepted("r1"));
        assert_eq!(
            effect,
            OutcomeEffect::Settled {
                outcome: BookingOutcome::accepted("r1"),
                late: false
            }
        );
        assert_eq!(sync.state("r1"), RequestState::SettledAccepted);
        assert!(sync.pending().is_empty());
    }

    #[test]
    fn duplicate_outcome_is_a_no_op() {
        let mut sync = sync_with_s1("v1");
        sync.begin(request("r1"));
        sync.apply_outcome(&BookingOutcome::rejected("r1", RejectReason::SeatTaken));

        // a conflicting redelivery must not flip the settled state
        assert_eq!(sync.apply_outcome(&BookingOutcome::accepted("r1")), OutcomeEffect::Duplicate);
        assert_eq!(sync.state("r1"), RequestState::SettledRejected);
        assert_eq!(
            sync.outcome("r1"),
            Some(&BookingOutcome::rejected("r1", RejectReason::SeatTaken))
        );
    }

    #[test]
    fn late_outcome_after_timeout_still_settles() {
        let mut sync = sync_with_s1("v1");
        sync.begin(request("r1"));
        assert!(sync.mark_timed_out("r1"));
        assert_eq!(sync.state("r1"), RequestState::AwaitingOutcome);

        let effect = sync.apply_outcome(&BookingOutcome::accepted("r1"));
        assert!(matches!(effect, OutcomeEffect::Settled { late: true, .. }));
        assert!(!sync.mark_timed_out("r1"));
    }

    #[test]
    fn unknown_outcomes_are_ignored() {
        let mut sync = sync_with_s1("v1");
        assert_eq!(sync.apply_outcome(&BookingOutcome::accepted("zz")), OutcomeEffect::Unknown);
    }

    #[test]
    fn resubmit_keeps_the_settled_state() {
        let mut sync = sync_with_s1("v1");
        sync.begin(request("r1"));
        sync.apply_outcome(&BookingOutcome::accepted("r1"));
        assert_eq!(sync.begin(request("r1")), RequestState::SettledAccepted);
    }

    #[test]
    fn not_connected_settles_locally() {
        let mut sync = sync_with_s1("v1");
        sync.begin(request("r1"));
        sync.settle_locally("r1", RejectReason::NotConnected);
        assert_eq!(sync.state("r1"), RequestState::SettledRejected);
        assert_eq!(sync.outcome("r1").unwrap().reason, Some(RejectReason::NotConnected));

        // never reached the arbiter, so a resubmit waits again
        assert_eq!(sync.begin(request("r1")), RequestState::AwaitingOutcome);
        assert!(sync.outcome("r1").is_none());
    }

    #[test]
    fn closing_a_showing_discards_its_updates() {
        let mut sync = sync_with_s1("v1");
        sync.toggle("S1", &a(1)).unwrap();
        assert_eq!(sync.close("S1"), Some(vec![a(1)]));

        let update = SeatUpdate::new("S1", a(1), SeatState::Booked, Some("v2".into()), 1);
        assert_eq!(sync.apply_update(&update), ApplyResult::OtherShowing);
        assert!(sync.toggle("S1", &a(1)).is_err());
    }

    #[test]
    fn reopening_keeps_the_existing_map() {
        let mut sync = sync_with_s1("v1");
        sync.toggle("S1", &a(2)).unwrap();
        assert!(!sync.open(&RoomLayout::with_seats("S1", [a(1), a(2)])));
        assert_eq!(sync.map("S1").unwrap().status(&a(2)), Some(SeatStatus::HeldBySelf));
    }

    proptest! {
        #[test]
        fn first_delivered_outcome_wins(deliveries in prop::collection::vec(any::<bool>(), 1..10)) {
            let mut sync = sync_with_s1("v1");
            sync.begin(request("r1"));
            for accepted in &deliveries {
                let outcome = if *accepted {
                    BookingOutcome::accepted("r1")
                } else {
                    BookingOutcome::rejected("r1", RejectReason::SeatTaken)
                };
                sync.apply_outcome(&outcome);
            }
            let expected = if deliveries[0] {
                RequestState::SettledAccepted
            } else {
                RequestState::SettledRejected
            };
            prop_assert_eq!(sync.state("r1"), expected);
        }
    }
}
