//! Broker outages as seen by viewer sessions.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, fast_broker_config, seat, wait_for_status, Harness};
use seat_coordinator::broker::MemoryBroker;
use seat_coordinator::layout_client::StaticLayouts;
use seat_coordinator::models::{BookingRequest, RejectReason, SeatStatus};
use seat_coordinator::presence::{ConnectionState, PresenceChannel};
use seat_coordinator::session::{SessionOptions, SessionState, ViewerSession};
use seat_coordinator::synchronizer::RequestState;
use seat_coordinator::topics::TopicRouter;
use seat_coordinator::CoordinatorError;

fn presence_over(broker: Arc<MemoryBroker>) -> Arc<PresenceChannel> {
    Arc::new(PresenceChannel::new(
        broker,
        TopicRouter::new("cinema").unwrap(),
        &fast_broker_config(),
    ))
}

#[tokio::test]
async fn session_connects_after_transient_failures() {
    let broker = Arc::new(MemoryBroker::default());
    broker.fail_next_connects(3);
    let presence = presence_over(broker);

    let session = ViewerSession::connect(
        "v1",
        presence.clone(),
        Arc::new(StaticLayouts::with_standard_fallback()),
        SessionOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(presence.state(), ConnectionState::Connected);
    let snapshot = session.open_showing("S42").await.unwrap();
    assert_eq!(snapshot.capacity(), 96);
    assert_eq!(snapshot.available, 96);
}

#[tokio::test]
async fn unreachable_broker_fails_with_connection_timeout() {
    let broker = Arc::new(MemoryBroker::default());
    broker.go_offline().await;
    let presence = presence_over(broker);

    let err = ViewerSession::connect(
        "v1",
        presence.clone(),
        Arc::new(StaticLayouts::with_standard_fallback()),
        SessionOptions::default(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, CoordinatorError::ConnectionTimeout(_)));
    assert_eq!(presence.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn submit_while_disconnected_is_rejected_locally_then_resubmits() {
    let h = Harness::with_arbiter_running().await;
    let v1 = h.session("v1").await;
    v1.open_showing("S1").await.unwrap();
    v1.toggle("S1", &seat("C1")).await.unwrap();

    h.broker.go_offline().await;
    let presence = &h.presence;
    eventually("presence to notice the outage", || async move {
        presence.state() != ConnectionState::Connected
    })
    .await;

    let outcome = v1.submit("S1").await.unwrap();
    assert!(!outcome.accepted);
    assert_eq!(outcome.reason, Some(RejectReason::NotConnected));
    // local selection survives so the viewer can try again
    assert_eq!(
        v1.snapshot("S1").await.unwrap().unwrap().status_of(&seat("C1")),
        Some(SeatStatus::HeldBySelf)
    );

    h.broker.go_online();
    let broker = &h.broker;
    eventually("arbiter and session to re-subscribe", || async move {
        broker.subscriber_count("cinema/bookings/request").await == 1
            && broker.subscriber_count("cinema/bookings/response/v1").await == 1
            && broker.subscriber_count("cinema/showings/S1/seats").await == 1
    })
    .await;

    let retried = v1.resubmit(&outcome.request_id).await.unwrap();
    assert!(retried.accepted);
    assert_eq!(retried.request_id, outcome.request_id);
    wait_for_status(&v1, "S1", &seat("C1"), SeatStatus::Booked).await;

    let (state, _) = v1.request_state(&outcome.request_id).await.unwrap();
    assert_eq!(state, RequestState::SettledAccepted);
}

#[tokio::test]
async fn seat_updates_resume_after_reconnect() {
    let h = Harness::with_arbiter_running().await;
    let v1 = h.session("v1").await;
    v1.open_showing("S1").await.unwrap();

    h.broker.go_offline().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.broker.go_online();

    let broker = &h.broker;
    eventually("viewer and arbiter to be back", || async move {
        broker.subscriber_count("cinema/showings/S1/seats").await == 1
            && broker.subscriber_count("cinema/bookings/request").await == 1
    })
    .await;

    let request = BookingRequest::new("v2", "S1", [seat("D4")]).with_request_id("rv2");
    assert!(h.arbiter.process_request(&request).await.unwrap().accepted);
    wait_for_status(&v1, "S1", &seat("D4"), SeatStatus::Booked).await;
}

#[tokio::test]
async fn closed_session_refuses_commands() {
    let h = Harness::new().await;
    let v1 = h.session("v1").await;
    v1.open_showing("S1").await.unwrap();
    assert_eq!(h.presence.viewer_count("S1"), 1);

    v1.close().await.unwrap();
    assert_eq!(v1.state(), SessionState::Closed);
    assert_eq!(h.presence.viewer_count("S1"), 0);
    assert!(matches!(
        v1.open_showing("S1").await,
        Err(CoordinatorError::SessionClosed)
    ));
}

#[tokio::test]
async fn opening_an_unknown_showing_leaves_no_subscription() {
    let h = Harness::new().await;
    let v1 = h.session("v1").await;

    assert!(matches!(
        v1.open_showing("S404").await,
        Err(CoordinatorError::InvalidRequest(_))
    ));
    assert_eq!(h.presence.viewer_count("S404"), 0);
    assert!(h.presence.active_showings().is_empty());
}
