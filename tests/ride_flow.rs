use std::sync::Arc;

use driver_dispatch::capabilities::InMemoryCredentialStore;
use driver_dispatch::clock::SystemClock;
use driver_dispatch::event::RouteKind;
use driver_dispatch::model::{LatLng, OfferId, RideId, RideStep};
use driver_dispatch::testing::{
    direct_offer, drain_events, session_with_open_shift, ApiCall, FakeApiClient, FixedLocation,
};
use driver_dispatch::{AppError, DispatchConfig, DispatchEngine, DispatchEvent, ErrorKind};

async fn engine_with_ride(api: &Arc<FakeApiClient>) -> DispatchEngine {
    api.set_session(session_with_open_shift(1));
    api.set_active_ride(Some(direct_offer(7)));
    let engine = DispatchEngine::new(
        DispatchConfig::default(),
        api.clone(),
        Arc::new(InMemoryCredentialStore::with_token("t", None)),
        Arc::new(FixedLocation::at(19.44, -99.14)),
        Arc::new(SystemClock),
    )
    .unwrap();
    engine.initialize().await.unwrap();
    engine
}

fn ride_steps(calls: &[ApiCall]) -> Vec<&'static str> {
    calls
        .iter()
        .map(ApiCall::name)
        .filter(|n| n.starts_with("ride_") || *n == "cancel_ride")
        .collect()
}

#[tokio::test]
async fn forward_ride_reaches_finished() {
    let api = Arc::new(FakeApiClient::new());
    let engine = engine_with_ride(&api).await;
    let mut rx = engine.subscribe();

    engine.mark_arrived().await.unwrap();
    engine.board().await.unwrap();
    engine.finish_ride().await.unwrap();

    assert_eq!(
        ride_steps(&api.calls()),
        vec!["ride_arrived", "ride_board", "ride_finish"]
    );
    let events = drain_events(&mut rx);
    let steps: Vec<RideStep> = events
        .iter()
        .filter_map(|e| match e {
            DispatchEvent::RideStepChanged { step, .. } => Some(*step),
            _ => None,
        })
        .collect();
    assert_eq!(
        steps,
        vec![RideStep::Arrived, RideStep::Onboard, RideStep::Finished]
    );
    assert!(events.contains(&DispatchEvent::RideCompleted {
        ride_id: RideId(1007),
        outcome: RideStep::Finished,
    }));
    assert!(engine.active_ride().await.is_none());
}

#[tokio::test]
async fn skipping_ahead_is_rejected_without_a_server_call() {
    let api = Arc::new(FakeApiClient::new());
    let engine = engine_with_ride(&api).await;

    // board → finish before arriving
    assert_eq!(engine.board().await.unwrap_err().kind, ErrorKind::Validation);
    assert_eq!(
        engine.finish_ride().await.unwrap_err().kind,
        ErrorKind::Validation
    );
    assert!(ride_steps(&api.calls()).is_empty());

    // arrive → finish without boarding
    engine.mark_arrived().await.unwrap();
    assert_eq!(
        engine.finish_ride().await.unwrap_err().kind,
        ErrorKind::Validation
    );
    assert_eq!(ride_steps(&api.calls()), vec!["ride_arrived"]);
    assert_eq!(
        engine.active_ride().await.map(|r| r.step),
        Some(RideStep::Arrived)
    );
}

#[tokio::test]
async fn cancellation_ends_the_ride() {
    let api = Arc::new(FakeApiClient::new());
    let engine = engine_with_ride(&api).await;
    engine.mark_arrived().await.unwrap();

    assert_eq!(
        engine.cancel_ride("").await.unwrap_err().kind,
        ErrorKind::Validation
    );
    engine.cancel_ride("Passenger not responding").await.unwrap();
    assert_eq!(
        api.last("cancel_ride"),
        Some(ApiCall::CancelRide(
            RideId(1007),
            "Passenger not responding".into()
        ))
    );
    assert!(engine.active_ride().await.is_none());
    assert_eq!(
        engine.mark_arrived().await.unwrap_err().kind,
        ErrorKind::Validation
    );
}

#[tokio::test]
async fn trip_route_falls_back_to_a_straight_segment() {
    let api = Arc::new(FakeApiClient::new());
    let engine = engine_with_ride(&api).await;
    let mut rx = engine.subscribe();

    api.fail_always("fetch_route", AppError::new(ErrorKind::Timeout, "slow"));
    engine.mark_arrived().await.unwrap();
    engine.board().await.unwrap();

    let offer = direct_offer(7);
    let trip = drain_events(&mut rx).into_iter().find_map(|e| match e {
        DispatchEvent::RouteReady {
            kind: RouteKind::Trip,
            points,
            fallback,
            ..
        } => Some((points, fallback)),
        _ => None,
    });
    let destination = offer.destination.map(|d| d.point);
    assert_eq!(
        trip,
        Some((
            vec![offer.origin.point, destination.unwrap_or(LatLng::UNKNOWN)],
            true
        ))
    );
}

#[tokio::test]
async fn offer_cannot_be_accepted_before_it_is_listed() {
    let api = Arc::new(FakeApiClient::new());
    api.set_offers(vec![direct_offer(3)]);
    let engine = DispatchEngine::new(
        DispatchConfig::default(),
        api.clone(),
        Arc::new(InMemoryCredentialStore::with_token("t", None)),
        Arc::new(FixedLocation::at(19.44, -99.14)),
        Arc::new(SystemClock),
    )
    .unwrap();
    engine.initialize().await.unwrap();

    // Never polled, so the desk does not know the offer.
    assert_eq!(
        engine.accept_offer(OfferId(3)).await.unwrap_err().kind,
        ErrorKind::NotFound
    );
    assert_eq!(api.count("accept_offer"), 0);
    assert!(engine.active_ride().await.is_none());
}

#[tokio::test]
async fn startup_resumes_the_ride_at_its_server_step() {
    let api = Arc::new(FakeApiClient::new());
    let mut offer = direct_offer(4);
    offer.ride_status = Some("arrived".into());
    api.set_session(session_with_open_shift(1));
    api.set_active_ride(Some(offer));
    let engine = DispatchEngine::new(
        DispatchConfig::default(),
        api.clone(),
        Arc::new(InMemoryCredentialStore::with_token("t", None)),
        Arc::new(FixedLocation::at(19.44, -99.14)),
        Arc::new(SystemClock),
    )
    .unwrap();
    let mut rx = engine.subscribe();
    engine.initialize().await.unwrap();

    // 1. The ride comes back at "arrived" with its pickup route
    let ride = engine.active_ride().await.unwrap();
    assert_eq!(ride.ride_id, RideId(1004));
    assert_eq!(ride.step, RideStep::Arrived);
    let events = drain_events(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, DispatchEvent::RouteReady { kind: RouteKind::Pickup, .. })));

    // 2. Offers stay hidden while it runs
    assert!(engine.presented_offer().is_none());

    // 3. It continues from there
    engine.board().await.unwrap();
    assert_eq!(
        engine.active_ride().await.map(|r| r.step),
        Some(RideStep::Onboard)
    );
}

#[tokio::test]
async fn finished_server_ride_is_not_resumed() {
    let api = Arc::new(FakeApiClient::new());
    let mut offer = direct_offer(4);
    offer.ride_status = Some("completed".into());
    api.set_active_ride(Some(offer));
    let engine = DispatchEngine::new(
        DispatchConfig::default(),
        api.clone(),
        Arc::new(InMemoryCredentialStore::with_token("t", None)),
        Arc::new(FixedLocation::at(19.44, -99.14)),
        Arc::new(SystemClock),
    )
    .unwrap();
    engine.initialize().await.unwrap();
    assert!(engine.active_ride().await.is_none());
}
