mod support;

use dispatch_core::dispatch::DispatchState;
use dispatch_core::error::DispatchError;
use dispatch_core::ports::{RequestStatus, RiderStatusKind};
use dispatch_core::test_helpers::{KIGALI_CENTER, KIGALI_DESTINATION};

use support::stack::{legs, stack};

#[tokio::test]
async fn full_scenario_expands_offers_declines_and_expires() {
    let s = stack();
    // Nobody within 5 km; one driver within the expanded 10 km.
    s.place_driver("far", 8_000.0).await;

    let ticket = s
        .dispatcher
        .create_ride_request("rider-1", KIGALI_CENTER, KIGALI_DESTINATION)
        .await
        .unwrap();
    assert_eq!(ticket.status, RequestStatus::Matching);
    assert_eq!(ticket.dispatch_state, DispatchState::Offered);
    assert_eq!(s.notifier.offered_drivers(), vec!["far".to_string()]);

    let snapshot = s.dispatcher.pending_snapshot(&ticket.request_id).await.unwrap();
    assert_eq!(snapshot.current_driver.as_deref(), Some("far"));
    assert_eq!(snapshot.search_radius_m, Some(10_000.0));
    assert!(snapshot.offer_armed);

    assert!(s.dispatcher.handle_decline(&ticket.request_id, "far").await);

    assert_eq!(
        s.notifier.status_kinds("rider-1"),
        vec![RiderStatusKind::DriverDeclined, RiderStatusKind::NoDrivers]
    );
    assert_eq!(s.repository.status(&ticket.request_id), Some(RequestStatus::Expired));
    assert_eq!(s.dispatcher.pending_count(), 0);
    assert!(s.dispatcher.pending_snapshot(&ticket.request_id).await.is_none());
    assert_eq!(s.dispatcher.telemetry().snapshot().requests_exhausted, 1);
}

#[tokio::test]
async fn no_drivers_at_all_expires_immediately() {
    let s = stack();
    let ticket = s
        .dispatcher
        .create_ride_request("rider-1", KIGALI_CENTER, KIGALI_DESTINATION)
        .await
        .unwrap();

    assert_eq!(ticket.dispatch_state, DispatchState::Exhausted);
    assert!(s.notifier.offers().is_empty());
    assert_eq!(s.notifier.status_kinds("rider-1"), vec![RiderStatusKind::NoDrivers]);
    assert_eq!(s.repository.status(&ticket.request_id), Some(RequestStatus::Expired));
    assert_eq!(s.dispatcher.pending_count(), 0);
}

#[tokio::test]
async fn best_scored_driver_gets_the_offer_and_accept_binds() {
    let s = stack();
    s.place_driver("a", 500.0).await;
    s.place_driver("b", 900.0).await;
    s.oracle.script("a", legs(300, 600));
    s.oracle.script("b", legs(200, 800));

    let request_id = s.request_ride("rider-1").await;
    let offers = s.notifier.offers();
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].0, "b");
    assert_eq!(offers[0].1.pickup_eta_sec, 200);
    assert_eq!(offers[0].1.trip_eta_sec, 800);

    let trip = s
        .dispatcher
        .handle_accept(&request_id, "b")
        .await
        .unwrap()
        .expect("bound");
    assert_eq!(trip.driver_id, "b");

    let trips = s.repository.trips();
    assert_eq!(trips.len(), 1);
    assert_eq!(trips[0].distance_m, 200 * 8 + 800 * 8);

    let statuses = s.notifier.statuses();
    let (rider, matched) = statuses.last().unwrap();
    assert_eq!(rider, "rider-1");
    assert_eq!(matched.status, RiderStatusKind::Matched);
    assert_eq!(matched.trip_id.as_deref(), Some(trip.trip_id.as_str()));
    assert_eq!(matched.driver_id.as_deref(), Some("b"));
    assert_eq!(matched.pickup_eta_sec, Some(200));

    assert_eq!(s.repository.status(&request_id), Some(RequestStatus::Matched));
    assert_eq!(s.dispatcher.pending_count(), 0);
}

#[tokio::test]
async fn accept_from_other_driver_is_rejected_without_side_effects() {
    let s = stack();
    s.place_driver("a", 500.0).await;
    s.place_driver("b", 900.0).await;
    s.oracle.script("a", legs(100, 600));
    s.oracle.script("b", legs(200, 600));
    let request_id = s.request_ride("rider-1").await;

    let stale = s.dispatcher.handle_accept(&request_id, "b").await.unwrap();
    assert!(stale.is_none());
    assert_eq!(s.repository.trip_attempts(), 0);
    assert!(s.notifier.statuses().is_empty());

    let snapshot = s.dispatcher.pending_snapshot(&request_id).await.unwrap();
    assert_eq!(snapshot.state, DispatchState::Offered);
    assert_eq!(snapshot.current_driver.as_deref(), Some("a"));

    let unknown = s.dispatcher.handle_accept("missing", "a").await.unwrap();
    assert!(unknown.is_none());
}

#[tokio::test]
async fn stray_declines_are_ignored() {
    let s = stack();
    s.place_driver("a", 500.0).await;
    let request_id = s.request_ride("rider-1").await;

    assert!(!s.dispatcher.handle_decline(&request_id, "b").await);
    assert!(!s.dispatcher.handle_decline("missing", "a").await);

    assert!(s.notifier.statuses().is_empty());
    assert_eq!(s.notifier.offers().len(), 1);
    let snapshot = s.dispatcher.pending_snapshot(&request_id).await.unwrap();
    assert!(snapshot.declined.is_empty());
}

#[tokio::test]
async fn decline_after_bind_is_a_no_op() {
    let s = stack();
    s.place_driver("a", 500.0).await;
    let request_id = s.request_ride("rider-1").await;
    s.dispatcher.handle_accept(&request_id, "a").await.unwrap();

    let before = s.notifier.statuses().len();
    assert!(!s.dispatcher.handle_decline(&request_id, "a").await);
    assert_eq!(s.notifier.statuses().len(), before);
}

#[tokio::test]
async fn decline_moves_to_next_driver_and_never_reoffers() {
    let s = stack();
    s.place_driver("a", 500.0).await;
    s.place_driver("b", 900.0).await;
    s.oracle.script("a", legs(100, 600));
    s.oracle.script("b", legs(200, 600));
    let request_id = s.request_ride("rider-1").await;

    assert!(s.dispatcher.handle_decline(&request_id, "a").await);
    assert_eq!(s.notifier.offered_drivers(), vec!["a".to_string(), "b".to_string()]);

    let declined_status = &s.notifier.statuses()[0].1;
    assert_eq!(declined_status.status, RiderStatusKind::DriverDeclined);
    assert!(declined_status.message.is_some());

    assert!(s.dispatcher.handle_decline(&request_id, "b").await);
    assert_eq!(s.notifier.offers().len(), 2);
    assert_eq!(s.repository.status(&request_id), Some(RequestStatus::Expired));
}

#[tokio::test]
async fn unreachable_driver_is_skipped_without_timer() {
    let s = stack();
    s.place_driver("a", 500.0).await;
    s.place_driver("b", 900.0).await;
    s.oracle.script("a", legs(100, 600));
    s.oracle.script("b", legs(200, 600));
    s.notifier.disconnect("a");

    let request_id = s.request_ride("rider-1").await;
    assert_eq!(s.notifier.offered_drivers(), vec!["b".to_string()]);

    let snapshot = s.dispatcher.pending_snapshot(&request_id).await.unwrap();
    assert_eq!(snapshot.declined, vec!["a".to_string()]);
    assert_eq!(snapshot.current_driver.as_deref(), Some("b"));
    // No rider-facing decline for an unreachable driver.
    assert!(s.notifier.statuses().is_empty());
    assert_eq!(s.dispatcher.telemetry().snapshot().offers_undeliverable, 1);
}

#[tokio::test]
async fn ineligible_drivers_never_get_offers() {
    let s = stack();
    s.place_driver("busy", 200.0).await;
    s.place_driver("free", 900.0).await;
    s.eligibility.deny("busy");

    s.request_ride("rider-1").await;
    assert_eq!(s.notifier.offered_drivers(), vec!["free".to_string()]);
}

#[tokio::test]
async fn failed_trip_creation_counts_as_decline() {
    let s = stack();
    s.place_driver("a", 500.0).await;
    s.place_driver("b", 900.0).await;
    s.oracle.script("a", legs(100, 600));
    s.oracle.script("b", legs(200, 600));
    let request_id = s.request_ride("rider-1").await;

    s.repository.fail_trip_creation(true);
    let err = s.dispatcher.handle_accept(&request_id, "a").await.unwrap_err();
    assert!(matches!(err, DispatchError::Persistence(_)));

    let snapshot = s.dispatcher.pending_snapshot(&request_id).await.unwrap();
    assert_eq!(snapshot.current_driver.as_deref(), Some("b"));
    assert_eq!(snapshot.declined, vec!["a".to_string()]);

    s.repository.fail_trip_creation(false);
    assert!(s.dispatcher.handle_accept(&request_id, "b").await.unwrap().is_some());
}

#[tokio::test]
async fn routing_outage_expires_the_request() {
    let s = stack();
    s.place_driver("a", 500.0).await;
    s.oracle.set_outage(true);

    let ticket = s
        .dispatcher
        .create_ride_request("rider-1", KIGALI_CENTER, KIGALI_DESTINATION)
        .await
        .unwrap();
    assert_eq!(ticket.dispatch_state, DispatchState::Exhausted);
    assert_eq!(s.notifier.status_kinds("rider-1"), vec![RiderStatusKind::NoDrivers]);
    assert_eq!(s.dispatcher.pending_count(), 0);
}

#[tokio::test]
async fn routing_outage_during_next_candidate_expires_the_request() {
    let s = stack();
    s.place_driver("a", 500.0).await;
    s.place_driver("b", 900.0).await;
    let request_id = s.request_ride("rider-1").await;

    s.oracle.set_outage(true);
    let first = s.notifier.offered_drivers()[0].clone();
    assert!(s.dispatcher.handle_decline(&request_id, &first).await);
    assert_eq!(s.notifier.offers().len(), 1);
    assert_eq!(s.repository.status(&request_id), Some(RequestStatus::Expired));
}

#[tokio::test]
async fn only_owner_may_cancel() {
    let s = stack();
    s.place_driver("a", 500.0).await;
    let request_id = s.request_ride("rider-1").await;

    let err = s.dispatcher.cancel(&request_id, "intruder").await.unwrap_err();
    assert!(matches!(err, DispatchError::NotRequestOwner { .. }));
    assert_eq!(s.dispatcher.pending_count(), 1);

    assert!(s.dispatcher.cancel(&request_id, "rider-1").await.unwrap());
    assert_eq!(s.repository.status(&request_id), Some(RequestStatus::Canceled));
    assert_eq!(s.dispatcher.pending_count(), 0);

    // The driver's late accept finds nothing.
    assert!(s.dispatcher.handle_accept(&request_id, "a").await.unwrap().is_none());
    assert_eq!(s.repository.trip_attempts(), 0);
}

#[tokio::test]
async fn bound_request_cannot_be_canceled() {
    let s = stack();
    s.place_driver("a", 500.0).await;
    let request_id = s.request_ride("rider-1").await;
    s.dispatcher.handle_accept(&request_id, "a").await.unwrap();

    assert!(!s.dispatcher.cancel(&request_id, "rider-1").await.unwrap());
    assert_eq!(s.repository.status(&request_id), Some(RequestStatus::Matched));
}

#[tokio::test]
async fn disconnect_of_offered_driver_declines_immediately() {
    let s = stack();
    s.place_driver("a", 500.0).await;
    s.place_driver("b", 900.0).await;
    s.oracle.script("a", legs(100, 600));
    s.oracle.script("b", legs(200, 600));
    let request_id = s.request_ride("rider-1").await;

    s.dispatcher.handle_driver_disconnected("a").await.unwrap();

    assert_eq!(s.notifier.offered_drivers(), vec!["a".to_string(), "b".to_string()]);
    assert_eq!(s.notifier.status_kinds("rider-1"), vec![RiderStatusKind::DriverDeclined]);
    assert!(s.dispatcher.ingest().get_driver_position("a").await.unwrap().is_none());
    let snapshot = s.dispatcher.pending_snapshot(&request_id).await.unwrap();
    assert_eq!(snapshot.current_driver.as_deref(), Some("b"));
}

#[tokio::test]
async fn duplicate_create_is_rejected() {
    let s = stack();
    s.place_driver("a", 500.0).await;
    s.dispatcher
        .create("req-x", "rider-1", KIGALI_CENTER, KIGALI_DESTINATION)
        .await
        .unwrap();
    let err = s
        .dispatcher
        .create("req-x", "rider-1", KIGALI_CENTER, KIGALI_DESTINATION)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::RequestAlreadyPending(_)));
    assert_eq!(s.notifier.offers().len(), 1);
}

#[tokio::test]
async fn invalid_pickup_is_rejected_before_persisting() {
    let s = stack();
    let err = s
        .dispatcher
        .create_ride_request(
            "rider-1",
            dispatch_core::geo::Coordinate { lat: 95.0, lon: 30.0 },
            KIGALI_DESTINATION,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidCoordinate { .. }));
    assert!(s.repository.status_updates().is_empty());
}

#[tokio::test]
async fn requests_are_dispatched_independently() {
    let s = stack();
    s.place_driver("a", 500.0).await;
    s.place_driver("b", 900.0).await;

    let (first, second) = tokio::join!(s.request_ride("rider-1"), s.request_ride("rider-2"));
    assert_ne!(first, second);
    assert_eq!(s.dispatcher.pending_count(), 2);
    assert_eq!(s.notifier.offers().len(), 2);
}

#[tokio::test]
async fn ineligible_nearest_drivers_do_not_hide_eligible_ones() {
    let s = stack();
    for i in 0..5 {
        let id = format!("busy{i}");
        s.place_driver(&id, 100.0 + f64::from(i) * 10.0).await;
        s.eligibility.deny(&id);
    }
    for i in 0..5 {
        s.place_driver(&format!("free{i}"), 1_000.0 + f64::from(i) * 100.0).await;
    }

    let request_id = s.request_ride("rider-1").await;
    assert_eq!(s.notifier.offered_drivers(), vec!["free0".to_string()]);

    for i in 0..4 {
        assert!(s.dispatcher.handle_decline(&request_id, &format!("free{i}")).await);
    }
    assert_eq!(
        s.notifier.offered_drivers(),
        (0..5).map(|i| format!("free{i}")).collect::<Vec<_>>()
    );
}
