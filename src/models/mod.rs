pub mod seat;
pub mod booking;
pub mod update;
pub mod layout;
pub mod snapshot;

pub use seat::{Seat, SeatId, SeatState, SeatStatus};
pub use booking::{BookingRequest, BookingOutcome, HoldIntent, RejectReason};
pub use update::SeatUpdate;
pub use layout::{RoomLayout, SeatSpec};
pub use snapshot::{SeatView, ShowingSnapshot};
