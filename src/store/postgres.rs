use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{error, info};

use super::BookingStore;
use crate::database::Database;
use crate::error::{CoordinatorError, Result};
use crate::models::{BookingOutcome, BookingRequest, SeatId};

/// PostgreSQL-backed store. The primary key on `booked_seats` is the last
/// line of defence against two arbiters booking the same seat.
#[derive(Clone)]
pub struct PgBookingStore {
    pool: PgPool,
}

impl PgBookingStore {
    pub fn new(db: &Database) -> Self {
        Self { pool: db.pool.clone() }
    }
}

#[async_trait]
impl BookingStore for PgBookingStore {
    async fn record(&self, request: &BookingRequest, outcome: &BookingOutcome) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO booking_outcomes (request_id, viewer_id, showing_id, accepted, reason, submitted_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (request_id) DO NOTHING
            "#,
        )
        .bind(&outcome.request_id)
        .bind(&request.viewer_id)
        .bind(&request.showing_id)
        .bind(outcome.accepted)
        .bind(outcome.reason.map(|r| r.as_str()))
        .bind(request.submitted_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            // already settled, first outcome wins
            let _ = tx.rollback().await;
            return Ok(());
        }

        if outcome.accepted {
            for seat in &request.seat_ids {
                let res = sqlx::query(
                    "INSERT INTO booked_seats (showing_id, seat_id, request_id, viewer_id)
                     VALUES ($1, $2, $3, $4)",
                )
                .bind(&request.showing_id)
                .bind(seat.to_string())
                .bind(&outcome.request_id)
                .bind(&request.viewer_id)
                .execute(&mut *tx)
                .await;

                if let Err(e) = res {
                    let _ = tx.rollback().await;
                    let unique = e
                        .as_database_error()
                        .map(|d| d.is_unique_violation())
                        .unwrap_or(false);
                    if unique {
                        return Err(CoordinatorError::SeatTaken(seat.clone()));
                    }
                    error!("failed to book seat {} for {}: {:?}", seat, outcome.request_id, e);
                    return Err(e.into());
                }
            }
        }

        tx.commit().await?;
        info!(
            "Recorded outcome for {} (accepted={}, seats={})",
            outcome.request_id,
            outcome.accepted,
            request.seat_ids.len()
        );
        Ok(())
    }

    async fn find(&self, request_id: &str) -> Result<Option<BookingOutcome>> {
        let row = sqlx::query_as::<_, (String, bool, Option<String>)>(
            "SELECT request_id, accepted, reason FROM booking_outcomes WHERE request_id = $1",
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((request_id, accepted, reason)) = row else {
            return Ok(None);
        };

        let reason = match reason {
            Some(r) => Some(r.parse().map_err(CoordinatorError::Store)?),
            None => None,
        };
        Ok(Some(BookingOutcome {
            request_id,
            accepted,
            reason,
        }))
    }

    async fn booked_seats(&self, showing_id: &str) -> Result<Vec<(SeatId, String)>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT seat_id, viewer_id FROM booked_seats WHERE showing_id = $1 ORDER BY seat_id",
        )
        .bind(showing_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(seat, viewer)| {
                seat.parse::<SeatId>()
                    .map(|id| (id, viewer))
                    .map_err(CoordinatorError::Store)
            })
            .collect()
    }
}
