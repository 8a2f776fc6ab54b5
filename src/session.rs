//! One viewer's connection to the coordinator.
//!
//! `ViewerSession` is a handle to a single task that owns the viewer's seat
//! maps and pending requests. Commands from the handle and messages from the
//! broker share one queue, so every state change happens on that task in
//! arrival order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerMessage, Subscription};
use crate::config::Config;
use crate::error::{CoordinatorError, Result};
use crate::layout_client::LayoutSource;
use crate::models::{BookingOutcome, BookingRequest, HoldIntent, RejectReason, SeatId, SeatStatus, SeatUpdate};
use crate::presence::{ConnectionState, PresenceChannel, PresenceHandle};
use crate::seat_map::SeatMapSnapshot;
use crate::synchronizer::{ClientSynchronizer, OutcomeEffect, RequestState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Ready,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// How long `submit` waits for the arbiter before `BookingTimedOut`.
    pub outcome_timeout: Duration,
    pub channel_buffer: usize,
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            outcome_timeout: config.booking.outcome_timeout(),
            channel_buffer: config.broker.channel_buffer,
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            outcome_timeout: Duration::from_secs(15),
            channel_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Stream {
    Responses,
    Showing(String),
}

enum Command {
    OpenShowing {
        showing_id: String,
        reply: oneshot::Sender<Result<SeatMapSnapshot>>,
    },
    CloseShowing {
        showing_id: String,
        reply: oneshot::Sender<bool>,
    },
    Toggle {
        showing_id: String,
        seat_id: SeatId,
        reply: oneshot::Sender<Result<SeatStatus>>,
    },
    Snapshot {
        showing_id: String,
        reply: oneshot::Sender<Option<SeatMapSnapshot>>,
    },
    Submit {
        showing_id: String,
        reply: oneshot::Sender<Result<(String, oneshot::Receiver<BookingOutcome>)>>,
    },
    Resubmit {
        request_id: String,
        reply: oneshot::Sender<Result<oneshot::Receiver<BookingOutcome>>>,
    },
    TimedOut {
        request_id: String,
    },
    RequestState {
        request_id: String,
        reply: oneshot::Sender<(RequestState, Option<BookingOutcome>)>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

enum Input {
    Command(Command),
    Broker(Stream, BrokerMessage),
    StreamEnded(Stream),
    Reattached(Stream, Subscription),
}

pub struct ViewerSession {
    viewer_id: String,
    inbox: mpsc::Sender<Input>,
    state: watch::Receiver<SessionState>,
    outcome_timeout: Duration,
    task: JoinHandle<()>,
}

impl ViewerSession {
    /// Connect a viewer: opens the viewer's response topic and starts the
    /// reconciliation task. Fails with `ConnectionTimeout` if the broker
    /// cannot be reached in time.
    pub async fn connect(
        viewer_id: impl Into<String>,
        presence: Arc<PresenceChannel>,
        layouts: Arc<dyn LayoutSource>,
        options: SessionOptions,
    ) -> Result<Self> {
        let viewer_id = viewer_id.into();
        let response_topic = presence.router().response_topic(&viewer_id)?;
        let (state_tx, state) = watch::channel(SessionState::Connecting);

        let responses = presence.open(&response_topic).await?;
        let (inbox, inbox_rx) = mpsc::channel(options.channel_buffer.max(1));

        let mut actor = Actor {
            viewer_id: viewer_id.clone(),
            scope: presence.new_scope(),
            response_topic,
            presence,
            layouts,
            sync: ClientSynchronizer::new(viewer_id.clone()),
            handles: HashMap::new(),
            streams: HashMap::new(),
            waiters: HashMap::new(),
            inbox: inbox.clone(),
            state: state_tx,
        };
        actor.attach(Stream::Responses, responses);
        actor.state.send_replace(SessionState::Ready);
        info!("Viewer session {} ready", viewer_id);

        let task = tokio::spawn(actor.run(inbox_rx));
        Ok(Self {
            viewer_id,
            inbox,
            state,
            outcome_timeout: options.outcome_timeout,
            task,
        })
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.inbox
            .send(Input::Command(command(reply)))
            .await
            .map_err(|_| CoordinatorError::SessionClosed)?;
        rx.await.map_err(|_| CoordinatorError::SessionClosed)
    }

    /// Start following a showing and return its seat map.
    pub async fn open_showing(&self, showing_id: &str) -> Result<SeatMapSnapshot> {
        self.call(|reply| Command::OpenShowing {
            showing_id: showing_id.to_string(),
            reply,
        })
        .await?
    }

    /// Stop following a showing. Outcomes of requests already submitted for
    /// it are still delivered.
    pub async fn close_showing(&self, showing_id: &str) -> Result<bool> {
        self.call(|reply| Command::CloseShowing {
            showing_id: showing_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn toggle(&self, showing_id: &str, seat_id: &SeatId) -> Result<SeatStatus> {
        self.call(|reply| Command::Toggle {
            showing_id: showing_id.to_string(),
            seat_id: seat_id.clone(),
            reply,
        })
        .await?
    }

    pub async fn snapshot(&self, showing_id: &str) -> Result<Option<SeatMapSnapshot>> {
        self.call(|reply| Command::Snapshot {
            showing_id: showing_id.to_string(),
            reply,
        })
        .await
    }

    /// Ask the arbiter to book the current selection on a showing.
    ///
    /// `BookingTimedOut` carries the request id; the request stays pending
    /// and a late outcome is still applied (see `request_state`).
    pub async fn submit(&self, showing_id: &str) -> Result<BookingOutcome> {
        let (request_id, rx) = self
            .call(|reply| Command::Submit {
                showing_id: showing_id.to_string(),
                reply,
            })
            .await??;
        self.await_outcome(request_id, rx).await
    }

    /// Send an earlier request again under the same request id.
    pub async fn resubmit(&self, request_id: &str) -> Result<BookingOutcome> {
        let rx = self
            .call(|reply| Command::Resubmit {
                request_id: request_id.to_string(),
                reply,
            })
            .await??;
        self.await_outcome(request_id.to_string(), rx).await
    }

    async fn await_outcome(&self, request_id: String, rx: oneshot::Receiver<BookingOutcome>) -> Result<BookingOutcome> {
        match tokio::time::timeout(self.outcome_timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(CoordinatorError::SessionClosed),
            Err(_) => {
                let _ = self
                    .inbox
                    .send(Input::Command(Command::TimedOut {
                        request_id: request_id.clone(),
                    }))
                    .await;
                Err(CoordinatorError::BookingTimedOut(request_id))
            }
        }
    }

    pub async fn request_state(&self, request_id: &str) -> Result<(RequestState, Option<BookingOutcome>)> {
        self.call(|reply| Command::RequestState {
            request_id: request_id.to_string(),
            reply,
        })
        .await
    }

    /// Release everything and stop the session. Later calls fail with
    /// `SessionClosed`.
    pub async fn close(&self) -> Result<()> {
        self.call(|reply| Command::Close { reply }).await
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for ViewerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewerSession")
            .field("viewer_id", &self.viewer_id)
            .field("state", &self.state())
            .finish()
    }
}

struct Actor {
    viewer_id: String,
    /// Presence scope of this session; other sessions of the same viewer
    /// register separately.
    scope: u64,
    response_topic: String,
    presence: Arc<PresenceChannel>,
    layouts: Arc<dyn LayoutSource>,
    sync: ClientSynchronizer,
    handles: HashMap<String, PresenceHandle>,
    /// Forwarder (or reconnect) task per stream.
    streams: HashMap<Stream, JoinHandle<()>>,
    waiters: HashMap<String, Vec<oneshot::Sender<BookingOutcome>>>,
    inbox: mpsc::Sender<Input>,
    state: watch::Sender<SessionState>,
}

impl Actor {
    async fn run(mut self, mut inbox: mpsc::Receiver<Input>) {
        while let Some(input) = inbox.recv().await {
            match input {
                Input::Command(Command::Close { reply }) => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
                Input::Command(command) => self.handle_command(command).await,
                Input::Broker(stream, message) => self.handle_message(&stream, message),
                Input::StreamEnded(stream) => self.reconnect(stream),
                Input::Reattached(stream, subscription) => {
                    let wanted = match &stream {
                        Stream::Responses => true,
                        Stream::Showing(id) => self.handles.contains_key(id),
                    };
                    if wanted {
                        info!("Viewer {} re-attached to {}", self.viewer_id, subscription.topic());
                        self.attach(stream, subscription);
                    }
                }
            }
        }
        self.state.send_replace(SessionState::Closed);
    }

    /* ---------- streams ---------- */

    fn attach(&mut self, stream: Stream, mut subscription: Subscription) {
        let tx = self.inbox.clone();
        let key = stream.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                if tx.send(Input::Broker(stream.clone(), message)).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(Input::StreamEnded(stream)).await;
        });
        if let Some(previous) = self.streams.insert(key, forwarder) {
            previous.abort();
        }
    }

    /// Re-open a dropped stream in the background.
    fn reconnect(&mut self, stream: Stream) {
        let handle = match &stream {
            Stream::Responses => None,
            Stream::Showing(id) => match self.handles.get(id) {
                Some(handle) => Some(handle.clone()),
                None => return,
            },
        };
        warn!("Viewer {} lost its {:?} stream, reconnecting", self.viewer_id, stream);
        self.presence.mark_disconnected();

        let presence = self.presence.clone();
        let topic = self.response_topic.clone();
        let tx = self.inbox.clone();
        let key = stream.clone();
        let task = tokio::spawn(async move {
            let mut delays = presence.retry().delays();
            loop {
                let result = match &handle {
                    Some(handle) => presence.resubscribe(handle).await,
                    None => presence.open(&topic).await,
                };
                match result {
                    Ok(subscription) => {
                        let _ = tx.send(Input::Reattached(stream, subscription)).await;
                        return;
                    }
                    Err(CoordinatorError::InvalidArgument(_)) => return,
                    Err(e) => {
                        let delay = delays.next().unwrap_or(presence.retry().max);
                        warn!("Reconnect failed: {}, retrying in {:?}", e, delay);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        });
        if let Some(previous) = self.streams.insert(key, task) {
            previous.abort();
        }
    }

    fn handle_message(&mut self, stream: &Stream, message: BrokerMessage) {
        match stream {
            Stream::Responses => match serde_json::from_str::<BookingOutcome>(&message.payload) {
                Ok(outcome) => self.settle(&outcome),
                Err(e) => warn!("Discarding malformed outcome on {}: {}", message.topic, e),
            },
            Stream::Showing(_) => match serde_json::from_str::<SeatUpdate>(&message.payload) {
                Ok(update) => {
                    let result = self.sync.apply_update(&update);
                    debug!("{} {} -> {:?}", update.showing_id, update.seat_id, result);
                }
                Err(e) => warn!("Discarding malformed seat update on {}: {}", message.topic, e),
            },
        }
    }

    fn settle(&mut self, outcome: &BookingOutcome) {
        if let OutcomeEffect::Settled { outcome, late } = self.sync.apply_outcome(outcome) {
            if late {
                info!("Late outcome for {} applied", outcome.request_id);
            }
            for waiter in self.waiters.remove(&outcome.request_id).unwrap_or_default() {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    /* ---------- commands ---------- */

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::OpenShowing { showing_id, reply } => {
                let _ = reply.send(self.open_showing(&showing_id).await);
            }
            Command::CloseShowing { showing_id, reply } => {
                let closed = self.close_showing(&showing_id).await;
                let _ = reply.send(closed);
            }
            Command::Toggle {
                showing_id,
                seat_id,
                reply,
            } => {
                let result = self.sync.toggle(&showing_id, &seat_id);
                if let Ok(status) = &result {
                    self.announce(&showing_id, &seat_id, *status == SeatStatus::HeldBySelf)
                        .await;
                }
                let _ = reply.send(result);
            }
            Command::Snapshot { showing_id, reply } => {
                let _ = reply.send(self.sync.snapshot(&showing_id));
            }
            Command::Submit { showing_id, reply } => {
                let selection = self.sync.map(&showing_id).map(|map| map.selection());
                let result = match selection {
                    None => Err(CoordinatorError::InvalidArgument(format!(
                        "showing '{}' is not open",
                        showing_id
                    ))),
                    Some(seats) if seats.is_empty() => {
                        Err(CoordinatorError::InvalidRequest("no seats selected".into()))
                    }
                    Some(seats) => {
                        let request = BookingRequest::new(self.viewer_id.clone(), showing_id.clone(), seats);
                        let request_id = request.request_id.clone();
                        Ok((request_id, self.submit(request).await))
                    }
                };
                let _ = reply.send(result);
            }
            Command::Resubmit { request_id, reply } => {
                let result = match self.sync.request(&request_id).cloned() {
                    Some(request) => Ok(self.submit(request).await),
                    None => Err(CoordinatorError::InvalidArgument(format!(
                        "unknown request '{}'",
                        request_id
                    ))),
                };
                let _ = reply.send(result);
            }
            Command::TimedOut { request_id } => {
                self.sync.mark_timed_out(&request_id);
            }
            Command::RequestState { request_id, reply } => {
                let _ = reply.send((
                    self.sync.state(&request_id),
                    self.sync.outcome(&request_id).cloned(),
                ));
            }
            Command::Close { reply } => {
                // handled by run
                let _ = reply.send(());
            }
        }
    }

    async fn open_showing(&mut self, showing_id: &str) -> Result<SeatMapSnapshot> {
        if let Some(snapshot) = self.sync.snapshot(showing_id) {
            return Ok(snapshot);
        }

        let attached = self.presence.subscribe_in(self.scope, &self.viewer_id, showing_id).await?;
        let layout = match self.layouts.layout(showing_id).await {
            Ok(layout) => layout,
            Err(e) => {
                self.presence.unsubscribe(&attached.handle);
                return Err(e);
            }
        };

        self.sync.open(&layout);
        self.handles.insert(showing_id.to_string(), attached.handle);
        if let Some(stream) = attached.stream {
            self.attach(Stream::Showing(showing_id.to_string()), stream);
        }
        info!("Viewer {} opened showing {}", self.viewer_id, showing_id);

        self.sync
            .snapshot(showing_id)
            .ok_or_else(|| CoordinatorError::InvalidArgument(format!("showing '{}' is not open", showing_id)))
    }

    async fn close_showing(&mut self, showing_id: &str) -> bool {
        if let Some(forwarder) = self.streams.remove(&Stream::Showing(showing_id.to_string())) {
            forwarder.abort();
        }
        if let Some(handle) = self.handles.remove(showing_id) {
            self.presence.unsubscribe(&handle);
        }
        let Some(released) = self.sync.close(showing_id) else {
            return false;
        };
        for seat_id in &released {
            self.announce(showing_id, seat_id, false).await;
        }
        info!("Viewer {} closed showing {}", self.viewer_id, showing_id);
        true
    }

    /// Tell the arbiter about a hold or release. Best effort: skipped while
    /// the broker is down.
    async fn announce(&self, showing_id: &str, seat_id: &SeatId, held: bool) {
        if self.presence.state() != ConnectionState::Connected {
            debug!("Not connected, hold intent for {} stays local", seat_id);
            return;
        }
        let intent = HoldIntent {
            showing_id: showing_id.to_string(),
            viewer_id: self.viewer_id.clone(),
            seat_id: seat_id.clone(),
            held,
        };
        let topic = self.presence.router().holds_topic();
        if let Err(e) = self.presence.publish_json(&topic, &intent).await {
            warn!("Hold intent for {} not delivered: {}", seat_id, e);
        }
    }

    async fn submit(&mut self, request: BookingRequest) -> oneshot::Receiver<BookingOutcome> {
        let (tx, rx) = oneshot::channel();
        let request_id = request.request_id.clone();

        match self.sync.begin(request.clone()) {
            RequestState::AwaitingOutcome => {}
            _ => {
                if let Some(outcome) = self.sync.outcome(&request_id) {
                    let _ = tx.send(outcome.clone());
                }
                return rx;
            }
        }
        self.waiters.entry(request_id.clone()).or_default().push(tx);

        if self.presence.state() != ConnectionState::Connected {
            warn!("Booking {} not sent, broker is not connected", request_id);
            self.settle(&BookingOutcome::rejected(&request_id, RejectReason::NotConnected));
            return rx;
        }

        let topic = self.presence.router().request_topic();
        match self.presence.publish_json(&topic, &request).await {
            Ok(()) => info!(
                "Booking {} submitted for {} seat(s) in showing {}",
                request_id,
                request.seat_ids.len(),
                request.showing_id
            ),
            Err(e) => {
                error!("Booking {} could not be sent: {}", request_id, e);
                self.settle(&BookingOutcome::rejected(&request_id, RejectReason::NotConnected));
            }
        }
        rx
    }

    async fn shutdown(&mut self) {
        let showings = self.sync.open_showings();
        for showing_id in showings {
            self.close_showing(&showing_id).await;
        }
        for (_, task) in self.streams.drain() {
            task.abort();
        }
        self.waiters.clear();
        self.state.send_replace(SessionState::Closed);
        info!("Viewer session {} closed", self.viewer_id);
    }
}

impl Drop for Actor {
    fn drop(&mut self) {
        for task in self.streams.values() {
            task.abort();
        }
    }
}
