use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{CoordinatorError, Result};
use crate::models::{RoomLayout, SeatId, SeatSpec, SeatState, ShowingSnapshot};

/// Read-only bootstrap of a showing's room layout.
#[async_trait]
pub trait LayoutSource: Send + Sync {
    async fn layout(&self, showing_id: &str) -> Result<RoomLayout>;
}

/// Layouts registered up front. Unknown showings either get the standard
/// room or are rejected.
#[derive(Debug, Default)]
pub struct StaticLayouts {
    layouts: RwLock<HashMap<String, RoomLayout>>,
    standard_fallback: bool,
}

impl StaticLayouts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every showing not registered explicitly gets `RoomLayout::standard`.
    pub fn with_standard_fallback() -> Self {
        Self {
            layouts: RwLock::new(HashMap::new()),
            standard_fallback: true,
        }
    }

    pub fn insert(&self, layout: RoomLayout) {
        let mut layouts = self.layouts.write().unwrap_or_else(|e| e.into_inner());
        layouts.insert(layout.showing_id.clone(), layout);
    }

    pub fn with(self, layout: RoomLayout) -> Self {
        self.insert(layout);
        self
    }
}

#[async_trait]
impl LayoutSource for StaticLayouts {
    async fn layout(&self, showing_id: &str) -> Result<RoomLayout> {
        let known = {
            let layouts = self.layouts.read().unwrap_or_else(|e| e.into_inner());
            layouts.get(showing_id).cloned()
        };
        match known {
            Some(layout) => Ok(layout),
            None if self.standard_fallback => Ok(RoomLayout::standard(showing_id)),
            None => Err(CoordinatorError::InvalidRequest(format!("unknown showing '{}'", showing_id))),
        }
    }
}

/// Seat row as served by `GET /showings/{id}/seats` of the showings API.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeatRow {
    id: Option<String>,
    row: String,
    number: u32,
    #[serde(default)]
    status: String,
    #[serde(default)]
    is_accessible: bool,
    price: f64,
}

impl SeatRow {
    fn into_spec(self) -> Result<SeatSpec> {
        let id = SeatId::new(self.row.to_ascii_uppercase(), self.number);
        if let Some(raw) = &self.id {
            if raw.parse::<SeatId>().ok().as_ref() != Some(&id) {
                warn!("Seat id '{}' does not match row/number {}, using {}", raw, id, id);
            }
        }
        let state = match self.status.as_str() {
            "booked" | "reserved" => SeatState::Booked,
            _ => SeatState::Available,
        };
        if !(self.price.is_finite() && self.price >= 0.0) {
            return Err(CoordinatorError::InvalidArgument(format!("seat {} has price {}", id, self.price)));
        }
        Ok(SeatSpec {
            id,
            accessible: self.is_accessible,
            price: (self.price * 100.0).round() as i64,
            state,
            holder: None,
            updated_at: None,
        })
    }
}

/// Client for the showings REST API.
#[derive(Clone)]
pub struct HttpLayoutClient {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpLayoutClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoordinatorError::InvalidArgument(format!("http client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }
}

#[async_trait]
impl LayoutSource for HttpLayoutClient {
    async fn layout(&self, showing_id: &str) -> Result<RoomLayout> {
        let url = format!("{}/showings/{}/seats", self.base_url, showing_id);
        info!("Fetching room layout for showing {}", showing_id);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| CoordinatorError::ConnectionError(format!("layout request failed: {}", e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CoordinatorError::InvalidRequest(format!("unknown showing '{}'", showing_id)));
        }
        let response = response
            .error_for_status()
            .map_err(|e| CoordinatorError::ConnectionError(format!("layout request failed: {}", e)))?;

        let rows: Vec<SeatRow> = response
            .json()
            .await
            .map_err(|e| CoordinatorError::InvalidArgument(format!("malformed layout: {}", e)))?;

        let seats = rows
            .into_iter()
            .map(SeatRow::into_spec)
            .collect::<Result<Vec<_>>>()?;
        Ok(RoomLayout::new(showing_id, seats))
    }
}

/// Seeds viewers from a remote arbiter's authoritative snapshot
/// (`GET {base}/showings/{id}/seats` of the arbiter service, `base` ending in
/// `/api`). Unlike the showings API this carries holds, holders and per-seat
/// timestamps.
#[derive(Clone)]
pub struct HttpSnapshotClient {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpSnapshotClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoordinatorError::InvalidArgument(format!("http client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }
}

#[async_trait]
impl LayoutSource for HttpSnapshotClient {
    async fn layout(&self, showing_id: &str) -> Result<RoomLayout> {
        let url = format!("{}/showings/{}/seats", self.base_url, showing_id);
        debug!("Fetching seat snapshot for showing {}", showing_id);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| CoordinatorError::ConnectionError(format!("snapshot request failed: {}", e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CoordinatorError::InvalidRequest(format!("unknown showing '{}'", showing_id)));
        }
        let snapshot: ShowingSnapshot = response
            .error_for_status()
            .map_err(|e| CoordinatorError::ConnectionError(format!("snapshot request failed: {}", e)))?
            .json()
            .await
            .map_err(|e| CoordinatorError::InvalidArgument(format!("malformed snapshot: {}", e)))?;

        if snapshot.showing_id != showing_id {
            return Err(CoordinatorError::InvalidArgument(format!(
                "asked for showing {}, got {}",
                showing_id, snapshot.showing_id
            )));
        }
        Ok(snapshot.into_layout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_layouts_fall_back_to_the_standard_room() {
        let layouts = StaticLayouts::with_standard_fallback();
        let layout = layouts.layout("S9").await.unwrap();
        assert_eq!(layout.capacity(), 96);
    }

    #[tokio::test]
    async fn static_layouts_without_fallback_reject_unknown_showings() {
        let layouts = StaticLayouts::new().with(RoomLayout::with_seats("S1", [SeatId::new("A", 1)]));
        assert_eq!(layouts.layout("S1").await.unwrap().capacity(), 1);
        assert!(matches!(
            layouts.layout("S2").await,
            Err(CoordinatorError::InvalidRequest(_))
        ));
    }

    #[test]
    fn seat_rows_convert_price_to_minor_units() {
        let row = SeatRow {
            id: Some("H1".into()),
            row: "H".into(),
            number: 1,
            status: "available".into(),
            is_accessible: true,
            price: 15.0,
        };
        let spec = row.into_spec().unwrap();
        assert_eq!(spec.id, SeatId::new("H", 1));
        assert_eq!(spec.price, 1500);
        assert!(spec.accessible);
        assert_eq!(spec.state, SeatState::Available);
    }
}
