pub mod arbiter;
pub mod cleanup;

pub use arbiter::BookingArbiter;
pub use crate::models::{SeatView, ShowingSnapshot};
pub use cleanup::{CleanupService, CleanupStats};
