//! Process-local counters for ingest and dispatch outcomes.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct DispatchTelemetry {
    location_updates_applied: AtomicU64,
    location_updates_throttled: AtomicU64,
    location_updates_rejected: AtomicU64,
    offers_sent: AtomicU64,
    offers_declined: AtomicU64,
    offers_timed_out: AtomicU64,
    offers_undeliverable: AtomicU64,
    requests_bound: AtomicU64,
    requests_exhausted: AtomicU64,
    requests_canceled: AtomicU64,
}

/// Point-in-time copy of [`DispatchTelemetry`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub location_updates_applied: u64,
    pub location_updates_throttled: u64,
    pub location_updates_rejected: u64,
    pub offers_sent: u64,
    pub offers_declined: u64,
    pub offers_timed_out: u64,
    pub offers_undeliverable: u64,
    pub requests_bound: u64,
    pub requests_exhausted: u64,
    pub requests_canceled: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl DispatchTelemetry {
    pub fn record_location_applied(&self) {
        bump(&self.location_updates_applied);
    }

    pub fn record_location_throttled(&self) {
        bump(&self.location_updates_throttled);
    }

    pub fn record_location_rejected(&self) {
        bump(&self.location_updates_rejected);
    }

    pub fn record_offer_sent(&self) {
        bump(&self.offers_sent);
    }

    pub fn record_offer_declined(&self) {
        bump(&self.offers_declined);
    }

    pub fn record_offer_timed_out(&self) {
        bump(&self.offers_timed_out);
    }

    pub fn record_offer_undeliverable(&self) {
        bump(&self.offers_undeliverable);
    }

    pub fn record_request_bound(&self) {
        bump(&self.requests_bound);
    }

    pub fn record_request_exhausted(&self) {
        bump(&self.requests_exhausted);
    }

    pub fn record_request_canceled(&self) {
        bump(&self.requests_canceled);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        TelemetrySnapshot {
            location_updates_applied: load(&self.location_updates_applied),
            location_updates_throttled: load(&self.location_updates_throttled),
            location_updates_rejected: load(&self.location_updates_rejected),
            offers_sent: load(&self.offers_sent),
            offers_declined: load(&self.offers_declined),
            offers_timed_out: load(&self.offers_timed_out),
            offers_undeliverable: load(&self.offers_undeliverable),
            requests_bound: load(&self.requests_bound),
            requests_exhausted: load(&self.requests_exhausted),
            requests_canceled: load(&self.requests_canceled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let telemetry = DispatchTelemetry::default();
        telemetry.record_offer_sent();
        telemetry.record_offer_sent();
        telemetry.record_offer_timed_out();
        telemetry.record_request_exhausted();

        let snap = telemetry.snapshot();
        assert_eq!(snap.offers_sent, 2);
        assert_eq!(snap.offers_timed_out, 1);
        assert_eq!(snap.requests_exhausted, 1);
        assert_eq!(snap.requests_bound, 0);

        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"offers_sent\":2"));
    }
}
