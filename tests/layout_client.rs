use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use seat_coordinator::layout_client::{HttpLayoutClient, HttpSnapshotClient, LayoutSource};
use seat_coordinator::models::{SeatId, SeatState};
use seat_coordinator::CoordinatorError;

fn client(server: &MockServer) -> HttpLayoutClient {
    HttpLayoutClient::new(&server.uri(), Duration::from_secs(2)).unwrap()
}

#[tokio::test]
async fn fetches_layout_and_converts_prices() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/showings/S7/seats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": "A1", "row": "A", "number": 1, "status": "available", "isAccessible": false, "price": 10.5 },
            { "id": "h1", "row": "h", "number": 1, "status": "booked", "isAccessible": true, "price": 15.0 }
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let layout = client(&server).layout("S7").await.unwrap();
    assert_eq!(layout.showing_id, "S7");
    assert_eq!(layout.capacity(), 2);

    let h1 = layout.seats.iter().find(|s| s.id == SeatId::new("H", 1)).unwrap();
    assert_eq!(h1.price, 1500);
    assert!(h1.accessible);
    assert_eq!(h1.state, SeatState::Booked);

    let a1 = layout.seats.iter().find(|s| s.id == SeatId::new("A", 1)).unwrap();
    assert_eq!(a1.price, 1050);
    assert_eq!(a1.state, SeatState::Available);
}

#[tokio::test]
async fn unknown_showing_is_an_invalid_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/showings/S404/seats"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    assert!(matches!(
        client(&server).layout("S404").await,
        Err(CoordinatorError::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn server_errors_are_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let err = client(&server).layout("S1").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::ConnectionError(_)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn negative_price_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/showings/S2/seats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "row": "A", "number": 1, "price": -1.0 }
        ])))
        .mount(&server)
        .await;

    assert!(matches!(
        client(&server).layout("S2").await,
        Err(CoordinatorError::InvalidArgument(_))
    ));
}

fn snapshot_client(server: &MockServer) -> HttpSnapshotClient {
    HttpSnapshotClient::new(&server.uri(), Duration::from_secs(2)).unwrap()
}

#[tokio::test]
async fn arbiter_snapshot_seeds_state_holder_and_timestamp() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/showings/S1/seats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "showingId": "S1",
            "seats": [
                { "id": "A1", "accessible": false, "price": 1200, "status": "booked", "viewerId": "v1", "timestamp": 1700 },
                { "id": "A2", "accessible": false, "price": 1200, "status": "held", "viewerId": "v3", "timestamp": 1701 },
                { "id": "A3", "accessible": true, "price": 1500, "status": "available" }
            ],
            "available": 1, "held": 1, "booked": 1, "totalCapacity": 3
        })))
        .expect(1)
        .mount(&server)
        .await;

    let layout = snapshot_client(&server).layout("S1").await.unwrap();
    assert_eq!(layout.capacity(), 3);

    let a1 = layout.seats.iter().find(|s| s.id == SeatId::new("A", 1)).unwrap();
    assert_eq!(a1.state, SeatState::Booked);
    assert_eq!(a1.holder.as_deref(), Some("v1"));
    assert_eq!(a1.updated_at, Some(1700));

    let a2 = layout.seats.iter().find(|s| s.id == SeatId::new("A", 2)).unwrap();
    assert_eq!(a2.state, SeatState::Held);
    assert_eq!(a2.holder.as_deref(), Some("v3"));

    let a3 = layout.seats.iter().find(|s| s.id == SeatId::new("A", 3)).unwrap();
    assert_eq!(a3.state, SeatState::Available);
    assert_eq!(a3.price, 1500);
    assert_eq!(a3.updated_at, None);
}

#[tokio::test]
async fn snapshot_for_another_showing_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/showings/S1/seats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "showingId": "S2", "seats": [],
            "available": 0, "held": 0, "booked": 0, "totalCapacity": 0
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/showings/S404/seats"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = snapshot_client(&server);
    assert!(matches!(
        client.layout("S1").await,
        Err(CoordinatorError::InvalidArgument(_))
    ));
    assert!(matches!(
        client.layout("S404").await,
        Err(CoordinatorError::InvalidRequest(_))
    ));
}
