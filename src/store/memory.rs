use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;

use super::BookingStore;
use crate::error::{CoordinatorError, Result};
use crate::models::{BookingOutcome, BookingRequest, SeatId};

#[derive(Debug, Default)]
struct Inner {
    outcomes: HashMap<String, BookingOutcome>,
    /// (showing, seat) -> viewer
    booked: HashMap<(String, SeatId), String>,
}

/// Process-local store, used by tests and the single-node setup.
#[derive(Debug, Default)]
pub struct MemoryBookingStore {
    inner: RwLock<Inner>,
    failing_records: AtomicU32,
}

impl MemoryBookingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `record` fail.
    pub fn fail_next_records(&self, n: u32) {
        self.failing_records.store(n, Ordering::SeqCst);
    }

    pub async fn outcome_count(&self) -> usize {
        self.inner.read().await.outcomes.len()
    }
}

#[async_trait]
impl BookingStore for MemoryBookingStore {
    async fn record(&self, request: &BookingRequest, outcome: &BookingOutcome) -> Result<()> {
        let failing = self
            .failing_records
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CoordinatorError::Store("store unavailable".to_string()));
        }

        let mut inner = self.inner.write().await;
        if inner.outcomes.contains_key(&outcome.request_id) {
            return Ok(());
        }

        if outcome.accepted {
            for seat in &request.seat_ids {
                let key = (request.showing_id.clone(), seat.clone());
                if inner.booked.contains_key(&key) {
                    return Err(CoordinatorError::SeatTaken(seat.clone()));
                }
            }
            for seat in &request.seat_ids {
                inner
                    .booked
                    .insert((request.showing_id.clone(), seat.clone()), request.viewer_id.clone());
            }
        }

        inner.outcomes.insert(outcome.request_id.clone(), outcome.clone());
        Ok(())
    }

    async fn find(&self, request_id: &str) -> Result<Option<BookingOutcome>> {
        Ok(self.inner.read().await.outcomes.get(request_id).cloned())
    }

    async fn booked_seats(&self, showing_id: &str) -> Result<Vec<(SeatId, String)>> {
        let inner = self.inner.read().await;
        let mut seats: Vec<(SeatId, String)> = inner
            .booked
            .iter()
            .filter(|((showing, _), _)| showing == showing_id)
            .map(|((_, seat), viewer)| (seat.clone(), viewer.clone()))
            .collect();
        seats.sort();
        Ok(seats)
    }
}
