#![allow(dead_code)]

use std::time::Duration;

use dispatch_core::config::DispatchConfig;
use dispatch_core::routing::{FullRouteEta, RouteEta};
use dispatch_core::test_helpers::TestStack;

/// Offer timeout used by timer tests.
pub const OFFER_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Stack with default configuration.
pub fn stack() -> TestStack {
    TestStack::new()
}

/// Stack with a custom offer timeout.
pub fn stack_with_offer_timeout(timeout: Duration) -> TestStack {
    let mut config = DispatchConfig::default();
    config.timing.offer_timeout_ms = timeout.as_millis() as u64;
    TestStack::with_config(&config)
}

/// Pickup and trip legs with distances derived from durations.
pub fn legs(pickup_sec: u64, trip_sec: u64) -> FullRouteEta {
    FullRouteEta {
        pickup: RouteEta {
            duration_sec: pickup_sec,
            distance_m: pickup_sec * 8,
        },
        trip: RouteEta {
            duration_sec: trip_sec,
            distance_m: trip_sec * 8,
        },
    }
}

/// Let spawned tasks (offer timers) run to completion.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// Sleep past the offer deadline under a paused clock, then settle.
pub async fn elapse(duration: Duration) {
    tokio::time::sleep(duration).await;
    settle().await;
}
