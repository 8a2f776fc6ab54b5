//! Durable record of decided booking outcomes.
//!
//! The arbiter writes here before it publishes anything, so a replayed
//! request id can be answered from the store without re-validating.

pub mod memory;
pub mod postgres;

pub use memory::MemoryBookingStore;
pub use postgres::PgBookingStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{BookingOutcome, BookingRequest, SeatId};

#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Persist the outcome for `request`. For accepted outcomes the named
    /// seats are recorded as booked by the request's viewer.
    ///
    /// Recording the same request id twice keeps the first outcome.
    async fn record(&self, request: &BookingRequest, outcome: &BookingOutcome) -> Result<()>;

    async fn find(&self, request_id: &str) -> Result<Option<BookingOutcome>>;

    /// Seats already booked for a showing, with the booking viewer.
    async fn booked_seats(&self, showing_id: &str) -> Result<Vec<(SeatId, String)>>;
}
