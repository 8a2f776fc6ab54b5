//! Authoritative seat ledger and booking decisions.
//!
//! One ledger per showing, guarded by its own mutex. Deciding a request
//! (dedup lookup, validation, persisting, committing) happens entirely under
//! that lock; publishing the result happens after it is released and never
//! re-runs validation.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use validator::Validate;

use crate::broker::{Broker, RetryPolicy, Subscription};
use crate::config::{BookingConfig, BrokerConfig};
use crate::error::{CoordinatorError, Result};
use crate::layout_client::LayoutSource;
use crate::models::{
    BookingOutcome, BookingRequest, HoldIntent, RejectReason, RoomLayout, SeatId, SeatState, SeatUpdate, SeatView,
    ShowingSnapshot,
};
use crate::store::BookingStore;
use crate::topics::TopicRouter;

#[derive(Debug, Clone)]
struct LedgerSeat {
    accessible: bool,
    price: i64,
    state: SeatState,
    owner: Option<String>,
    hold_expires: Option<Instant>,
    /// Timestamp of the last update broadcast for this seat.
    stamp: Option<i64>,
}

#[derive(Debug)]
struct Ledger {
    showing_id: String,
    seats: BTreeMap<SeatId, LedgerSeat>,
    /// Last timestamp handed out, in epoch milliseconds.
    clock: i64,
}

impl Ledger {
    fn new(layout: RoomLayout, booked: Vec<(SeatId, String)>) -> Self {
        let mut seats: BTreeMap<SeatId, LedgerSeat> = layout
            .seats
            .into_iter()
            .map(|spec| {
                (
                    spec.id,
                    LedgerSeat {
                        accessible: spec.accessible,
                        price: spec.price,
                        state: match spec.state {
                            SeatState::Booked => SeatState::Booked,
                            _ => SeatState::Available,
                        },
                        owner: None,
                        hold_expires: None,
                        stamp: None,
                    },
                )
            })
            .collect();

        for (id, viewer) in booked {
            match seats.get_mut(&id) {
                Some(seat) => {
                    seat.state = SeatState::Booked;
                    seat.owner = Some(viewer);
                }
                None => warn!("booked seat {} is not part of showing {}", id, layout.showing_id),
            }
        }

        Self {
            showing_id: layout.showing_id,
            seats,
            clock: 0,
        }
    }

    /// Strictly increasing per showing, even if the wall clock stalls.
    fn tick(&mut self) -> i64 {
        self.clock = Utc::now().timestamp_millis().max(self.clock + 1);
        self.clock
    }

    fn set(
        &mut self,
        id: &SeatId,
        state: SeatState,
        owner: Option<String>,
        hold_expires: Option<Instant>,
    ) -> Option<SeatUpdate> {
        let timestamp = self.tick();
        let seat = self.seats.get_mut(id)?;
        seat.state = state;
        seat.owner = owner.clone();
        seat.hold_expires = hold_expires;
        seat.stamp = Some(timestamp);
        Some(SeatUpdate::new(self.showing_id.clone(), id.clone(), state, owner, timestamp))
    }

    fn expire_holds(&mut self, now: Instant) -> Vec<SeatUpdate> {
        let expired: Vec<SeatId> = self
            .seats
            .iter()
            .filter(|(_, s)| s.state == SeatState::Held && s.hold_expires.is_some_and(|at| at <= now))
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| {
                debug!("hold on {} in showing {} expired", id, self.showing_id);
                self.set(id, SeatState::Available, None, None)
            })
            .collect()
    }

    /// All-or-nothing check of a fresh request against the ledger.
    fn check(&self, request: &BookingRequest) -> std::result::Result<(), RejectReason> {
        if request.seat_ids.iter().any(|id| !self.seats.contains_key(id)) {
            return Err(RejectReason::InvalidRequest);
        }
        let free = request.seat_ids.iter().all(|id| {
            self.seats.get(id).is_some_and(|seat| match seat.state {
                SeatState::Available => true,
                SeatState::Held => seat.owner.as_deref() == Some(request.viewer_id.as_str()),
                SeatState::Booked => false,
            })
        });
        if free {
            Ok(())
        } else {
            Err(RejectReason::SeatTaken)
        }
    }

    fn hold(&mut self, intent: &HoldIntent, expires: Instant) -> Result<Option<SeatUpdate>> {
        let seat = self
            .seats
            .get_mut(&intent.seat_id)
            .ok_or_else(|| CoordinatorError::UnknownSeat(intent.seat_id.clone()))?;
        let mine = seat.owner.as_deref() == Some(intent.viewer_id.as_str());
        let state = seat.state;

        let update = match (intent.held, state) {
            (true, SeatState::Available) => self.set(
                &intent.seat_id,
                SeatState::Held,
                Some(intent.viewer_id.clone()),
                Some(expires),
            ),
            (true, SeatState::Held) if mine => {
                seat.hold_expires = Some(expires);
                None
            }
            (false, SeatState::Held) if mine => self.set(&intent.seat_id, SeatState::Available, None, None),
            _ => {
                debug!(
                    "ignoring {} of {} by {}, seat is {:?}",
                    if intent.held { "hold" } else { "release" },
                    intent.seat_id,
                    intent.viewer_id,
                    state
                );
                None
            }
        };
        Ok(update)
    }

    fn snapshot(&self) -> ShowingSnapshot {
        let mut snapshot = ShowingSnapshot {
            showing_id: self.showing_id.clone(),
            seats: Vec::with_capacity(self.seats.len()),
            available: 0,
            held: 0,
            booked: 0,
            total_capacity: self.seats.len(),
        };
        for (id, seat) in &self.seats {
            match seat.state {
                SeatState::Available => snapshot.available += 1,
                SeatState::Held => snapshot.held += 1,
                SeatState::Booked => snapshot.booked += 1,
            }
            snapshot.seats.push(SeatView {
                id: id.clone(),
                accessible: seat.accessible,
                price: seat.price,
                status: seat.state,
                viewer_id: seat.owner.clone(),
                timestamp: seat.stamp,
            });
        }
        snapshot
    }
}

struct Decision {
    outcome: BookingOutcome,
    updates: Vec<SeatUpdate>,
}

pub struct BookingArbiter {
    broker: Arc<dyn Broker>,
    store: Arc<dyn BookingStore>,
    layouts: Arc<dyn LayoutSource>,
    router: TopicRouter,
    retry: RetryPolicy,
    hold_ttl: Duration,
    max_seats: usize,
    ledgers: RwLock<HashMap<String, Arc<Mutex<Ledger>>>>,
}

impl BookingArbiter {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn BookingStore>,
        layouts: Arc<dyn LayoutSource>,
        router: TopicRouter,
        broker_config: &BrokerConfig,
        booking_config: &BookingConfig,
    ) -> Self {
        Self {
            broker,
            store,
            layouts,
            router,
            retry: RetryPolicy::from_config(broker_config),
            hold_ttl: booking_config.hold_ttl(),
            max_seats: booking_config.max_seats_per_request.max(1),
            ledgers: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_hold_ttl(mut self, ttl: Duration) -> Self {
        self.hold_ttl = ttl;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn router(&self) -> &TopicRouter {
        &self.router
    }

    async fn ledger(&self, showing_id: &str) -> Result<Arc<Mutex<Ledger>>> {
        if let Some(ledger) = self.ledgers.read().await.get(showing_id) {
            return Ok(ledger.clone());
        }

        self.router
            .seats_topic(showing_id)
            .map_err(|e| CoordinatorError::InvalidRequest(e.to_string()))?;
        let layout = self.layouts.layout(showing_id).await?;
        let booked = self.store.booked_seats(showing_id).await?;
        let ledger = Ledger::new(layout, booked);
        info!(
            "Loaded showing {} ({} seats, {} already booked)",
            showing_id,
            ledger.seats.len(),
            ledger.seats.values().filter(|s| s.state == SeatState::Booked).count()
        );

        let mut ledgers = self.ledgers.write().await;
        Ok(ledgers
            .entry(showing_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ledger)))
            .clone())
    }

    /* ---------- bookings ---------- */

    /// Decide a booking request and publish the result.
    ///
    /// A request id that was already decided gets its stored outcome back
    /// without validation. `Err` means nothing was decided and the same
    /// request can be retried.
    pub async fn process_request(&self, request: &BookingRequest) -> Result<BookingOutcome> {
        if request.request_id.trim().is_empty() {
            return Err(CoordinatorError::InvalidRequest("requestId must not be empty".into()));
        }
        let response_topic = self
            .router
            .response_topic(&request.viewer_id)
            .map_err(|e| CoordinatorError::InvalidRequest(e.to_string()))?;

        let decision = self.decide(request).await?;

        self.publish_updates(&decision.updates).await;
        if let Err(e) = self.publish(&response_topic, &decision.outcome).await {
            // the decision is stored, a resubmit replays it
            error!("Failed to deliver outcome for {}: {}", request.request_id, e);
        }
        Ok(decision.outcome)
    }

    fn malformed(&self, request: &BookingRequest) -> Option<String> {
        if let Err(e) = request.validate() {
            return Some(e.to_string());
        }
        if request.seat_ids.len() > self.max_seats {
            return Some(format!(
                "{} seats requested, at most {} allowed",
                request.seat_ids.len(),
                self.max_seats
            ));
        }
        None
    }

    /// Reject without touching any ledger, still deduplicated.
    async fn reject_invalid(&self, request: &BookingRequest, why: &str) -> Result<Decision> {
        if let Some(existing) = self.store.find(&request.request_id).await? {
            return Ok(Decision {
                outcome: existing,
                updates: Vec::new(),
            });
        }
        warn!("Rejecting request {}: {}", request.request_id, why);
        let outcome = BookingOutcome::rejected(&request.request_id, RejectReason::InvalidRequest);
        self.store.record(request, &outcome).await?;
        Ok(Decision {
            outcome,
            updates: Vec::new(),
        })
    }

    async fn decide(&self, request: &BookingRequest) -> Result<Decision> {
        if let Some(why) = self.malformed(request) {
            return self.reject_invalid(request, &why).await;
        }

        let ledger = match self.ledger(&request.showing_id).await {
            Ok(ledger) => ledger,
            Err(CoordinatorError::InvalidRequest(why)) => return self.reject_invalid(request, &why).await,
            Err(e) => return Err(e),
        };
        let mut ledger = ledger.lock().await;

        if let Some(existing) = self.store.find(&request.request_id).await? {
            info!("Replaying stored outcome for request {}", request.request_id);
            return Ok(Decision {
                outcome: existing,
                updates: Vec::new(),
            });
        }

        let mut updates = ledger.expire_holds(Instant::now());
        let mut outcome = match ledger.check(request) {
            Ok(()) => BookingOutcome::accepted(&request.request_id),
            Err(reason) => BookingOutcome::rejected(&request.request_id, reason),
        };

        match self.store.record(request, &outcome).await {
            Ok(()) => {}
            Err(CoordinatorError::SeatTaken(seat)) => {
                warn!(
                    "Seat {} of showing {} was booked elsewhere, rejecting {}",
                    seat, request.showing_id, request.request_id
                );
                updates.extend(self.resync_booked(&mut ledger).await?);
                outcome = BookingOutcome::rejected(&request.request_id, RejectReason::SeatTaken);
                self.store.record(request, &outcome).await?;
            }
            Err(e) => {
                drop(ledger);
                self.publish_updates(&updates).await;
                error!("Failed to persist outcome for {}: {}", request.request_id, e);
                return Err(e);
            }
        }

        if outcome.accepted {
            for seat in &request.seat_ids {
                updates.extend(ledger.set(seat, SeatState::Booked, Some(request.viewer_id.clone()), None));
            }
            info!(
                "✅ Booking {} accepted: {} seat(s) in showing {} for {}",
                request.request_id,
                request.seat_ids.len(),
                request.showing_id,
                request.viewer_id
            );
        } else {
            info!(
                "Booking {} rejected ({})",
                request.request_id,
                outcome.reason.map(|r| r.as_str()).unwrap_or("unknown")
            );
        }

        Ok(Decision { outcome, updates })
    }

    /// Pull seats booked by other arbiters into the ledger.
    async fn resync_booked(&self, ledger: &mut Ledger) -> Result<Vec<SeatUpdate>> {
        let booked = self.store.booked_seats(&ledger.showing_id).await?;
        let mut updates = Vec::new();
        for (id, viewer) in booked {
            let stale = ledger
                .seats
                .get(&id)
                .is_some_and(|seat| seat.state != SeatState::Booked);
            if stale {
                updates.extend(ledger.set(&id, SeatState::Booked, Some(viewer), None));
            }
        }
        Ok(updates)
    }

    /// Stored outcome for a request id, if it was decided.
    pub async fn outcome(&self, request_id: &str) -> Result<Option<BookingOutcome>> {
        self.store.find(request_id).await
    }

    /* ---------- holds ---------- */

    /// Apply a hold or release. Returns the update that was broadcast, if the
    /// intent changed the seat.
    pub async fn apply_hold(&self, intent: &HoldIntent) -> Result<Option<SeatUpdate>> {
        if intent.viewer_id.is_empty() {
            return Err(CoordinatorError::InvalidArgument("viewer id must not be empty".into()));
        }
        let ledger = self.ledger(&intent.showing_id).await?;

        let (expired, update) = {
            let mut ledger = ledger.lock().await;
            let now = Instant::now();
            let expired = ledger.expire_holds(now);
            (expired, ledger.hold(intent, now + self.hold_ttl))
        };

        self.publish_updates(&expired).await;
        let update = update?;
        if let Some(update) = &update {
            self.publish_updates(std::slice::from_ref(update)).await;
        }
        Ok(update)
    }

    /// Broadcast every hold past its TTL as available again.
    pub async fn sweep_expired_holds(&self) -> usize {
        let ledgers: Vec<Arc<Mutex<Ledger>>> = self.ledgers.read().await.values().cloned().collect();
        let mut released = 0;
        for ledger in ledgers {
            let updates = ledger.lock().await.expire_holds(Instant::now());
            released += updates.len();
            self.publish_updates(&updates).await;
        }
        released
    }

    /// Seats currently held across all loaded showings.
    pub async fn held_seat_count(&self) -> usize {
        let ledgers: Vec<Arc<Mutex<Ledger>>> = self.ledgers.read().await.values().cloned().collect();
        let mut held = 0;
        for ledger in ledgers {
            held += ledger
                .lock()
                .await
                .seats
                .values()
                .filter(|s| s.state == SeatState::Held)
                .count();
        }
        held
    }

    pub async fn loaded_showings(&self) -> usize {
        self.ledgers.read().await.len()
    }

    /* ---------- reads ---------- */

    pub async fn snapshot(&self, showing_id: &str) -> Result<ShowingSnapshot> {
        let ledger = self.ledger(showing_id).await?;
        let (expired, snapshot) = {
            let mut ledger = ledger.lock().await;
            let expired = ledger.expire_holds(Instant::now());
            (expired, ledger.snapshot())
        };
        self.publish_updates(&expired).await;
        Ok(snapshot)
    }

    /* ---------- publishing ---------- */

    async fn publish<T: Serialize + ?Sized>(&self, topic: &str, message: &T) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        let what = format!("publish to {}", topic);
        self.retry
            .run(&what, || {
                let payload = payload.clone();
                async move {
                    if !self.broker.is_connected() {
                        self.broker.connect().await?;
                    }
                    self.broker.publish(topic, payload).await
                }
            })
            .await
    }

    async fn publish_updates(&self, updates: &[SeatUpdate]) {
        for update in updates {
            let topic = match self.router.seats_topic(&update.showing_id) {
                Ok(topic) => topic,
                Err(e) => {
                    error!("No topic for showing {}: {}", update.showing_id, e);
                    continue;
                }
            };
            if let Err(e) = self.publish(&topic, update).await {
                error!("Dropped seat update for {} {}: {}", update.showing_id, update.seat_id, e);
            }
        }
    }

    /* ---------- broker loop ---------- */

    async fn attach(&self) -> Result<(Subscription, Subscription)> {
        if !self.broker.is_connected() {
            self.broker.connect().await?;
        }
        let requests = self.broker.subscribe(&self.router.request_topic()).await?;
        let holds = self.broker.subscribe(&self.router.holds_topic()).await?;
        Ok((requests, holds))
    }

    async fn reattach(&self) -> (Subscription, Subscription) {
        let mut delays = self.retry.delays();
        loop {
            match self.attach().await {
                Ok(subs) => return subs,
                Err(e) => {
                    let delay = delays.next().unwrap_or(self.retry.max);
                    warn!("Arbiter could not subscribe: {}, retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn handle_request_payload(&self, payload: &str) {
        let request: BookingRequest = match serde_json::from_str(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("Discarding malformed booking request: {}", e);
                return;
            }
        };
        if let Err(e) = self.process_request(&request).await {
            error!("Booking request {} not decided: {}", request.request_id, e);
        }
    }

    async fn handle_hold_payload(&self, payload: &str) {
        let intent: HoldIntent = match serde_json::from_str(payload) {
            Ok(intent) => intent,
            Err(e) => {
                warn!("Discarding malformed hold intent: {}", e);
                return;
            }
        };
        if let Err(e) = self.apply_hold(&intent).await {
            warn!(
                "Hold intent of {} on {} {} ignored: {}",
                intent.viewer_id, intent.showing_id, intent.seat_id, e
            );
        }
    }

    /// Subscribe to the request and hold topics, then consume them in the
    /// background. Returns once the subscriptions are live. Dropped
    /// subscriptions are re-established with backoff.
    pub async fn start(self: Arc<Self>) -> Result<JoinHandle<()>> {
        let (requests, holds) = self.attach().await?;
        info!(
            "Booking arbiter listening on {} and {}",
            self.router.request_topic(),
            self.router.holds_topic()
        );

        Ok(tokio::spawn(async move {
            let (mut requests, mut holds) = (requests, holds);
            loop {
                loop {
                    tokio::select! {
                        msg = requests.recv() => match msg {
                            Some(msg) => {
                                let arbiter = self.clone();
                                tokio::spawn(async move {
                                    arbiter.handle_request_payload(&msg.payload).await;
                                });
                            }
                            None => break,
                        },
                        msg = holds.recv() => match msg {
                            Some(msg) => self.handle_hold_payload(&msg.payload).await,
                            None => break,
                        },
                    }
                }
                warn!("Arbiter subscriptions dropped, reconnecting");
                (requests, holds) = self.reattach().await;
                info!("Booking arbiter re-subscribed");
            }
        }))
    }
}

/// Viewers in the same process seed their seat maps straight from the
/// ledger: status, holder and per-seat timestamp included.
#[async_trait]
impl LayoutSource for BookingArbiter {
    async fn layout(&self, showing_id: &str) -> Result<RoomLayout> {
        Ok(self.snapshot(showing_id).await?.into_layout())
    }
}
