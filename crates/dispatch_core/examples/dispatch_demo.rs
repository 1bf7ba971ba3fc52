//! Walk one ride request through decline, timeout and accept against
//! in-memory collaborators, logging every transition.
//!
//! Run with: RUST_LOG=dispatch_core=debug cargo run -p dispatch_core --example dispatch_demo

use std::time::Duration;

use dispatch_core::config::DispatchConfig;
use dispatch_core::logging::init_tracing;
use dispatch_core::test_helpers::TestStack;

#[tokio::main]
async fn main() -> dispatch_core::Result<()> {
    init_tracing("dispatch_core=info");

    let mut config = DispatchConfig::default().with_env_overrides()?;
    config.timing.offer_timeout_ms = config.timing.offer_timeout_ms.min(2_000);
    let stack = TestStack::with_config(&config);

    for (driver_id, meters_north) in [("amani", 400.0), ("bisa", 1_200.0), ("chidi", 2_500.0)] {
        stack.place_driver(driver_id, meters_north).await;
    }

    let request_id = stack.request_ride("rider-42").await;
    let first = stack.notifier.offered_drivers()[0].clone();
    println!("offered {request_id} to {first}");

    stack.dispatcher.handle_decline(&request_id, &first).await;
    let second = stack.notifier.offered_drivers()[1].clone();
    println!("{first} declined, offered to {second}; letting the offer expire");

    tokio::time::sleep(config.timing.offer_timeout() + Duration::from_millis(100)).await;
    let third = stack.notifier.offered_drivers()[2].clone();
    println!("{second} timed out, offered to {third}");

    if let Some(trip) = stack.dispatcher.handle_accept(&request_id, &third).await? {
        println!("{third} accepted, trip {}", trip.trip_id);
    }

    for (rider_id, status) in stack.notifier.statuses() {
        println!("  -> {rider_id}: {}", serde_json::to_string(&status).unwrap_or_default());
    }
    println!(
        "telemetry: {}",
        serde_json::to_string_pretty(&stack.dispatcher.telemetry().snapshot()).unwrap_or_default()
    );
    Ok(())
}
