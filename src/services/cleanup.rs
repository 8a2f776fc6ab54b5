use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use super::arbiter::BookingArbiter;

/// Periodically hands expired seat holds back to everyone.
pub struct CleanupService {
    arbiter: Arc<BookingArbiter>,
    interval: Duration,
}

impl CleanupService {
    pub fn new(arbiter: Arc<BookingArbiter>, interval: Duration) -> Self {
        Self {
            arbiter,
            interval: interval.max(Duration::from_millis(10)),
        }
    }

    /// One sweep over every loaded showing.
    pub async fn run_full_cleanup(&self) -> usize {
        let released = self.arbiter.sweep_expired_holds().await;
        if released == 0 {
            info!("🧹 No expired holds to release");
        } else {
            info!("🧹 Released {} expired hold(s)", released);
        }
        released
    }

    pub async fn get_cleanup_stats(&self) -> CleanupStats {
        CleanupStats {
            loaded_showings: self.arbiter.loaded_showings().await,
            held_seats: self.arbiter.held_seat_count().await,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.run_full_cleanup().await;
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub loaded_showings: usize,
    pub held_seats: usize,
}
