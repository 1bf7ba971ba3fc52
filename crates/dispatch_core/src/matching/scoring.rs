use std::cmp::Ordering;

use crate::config::MatchingConfig;
use crate::routing::FullRouteEta;

use super::types::MatchCandidate;

/// Scores a pairing as a weighted sum of pickup and trip durations.
/// Pickup latency is weighted more heavily by default.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EtaWeightedScoring {
    pub pickup_weight: f64,
    pub trip_weight: f64,
}

impl EtaWeightedScoring {
    pub fn new(pickup_weight: f64, trip_weight: f64) -> Self {
        Self {
            pickup_weight,
            trip_weight,
        }
    }

    pub fn from_config(config: &MatchingConfig) -> Self {
        Self::new(config.pickup_weight, config.trip_weight)
    }

    /// Lower is better.
    pub fn score(&self, eta: &FullRouteEta) -> f64 {
        self.pickup_weight * eta.pickup.duration_sec as f64
            + self.trip_weight * eta.trip.duration_sec as f64
    }

    /// Sort best-first and keep at most `max_candidates`.
    pub fn rank(&self, mut candidates: Vec<MatchCandidate>, max_candidates: usize) -> Vec<MatchCandidate> {
        candidates.sort_by(compare_candidates);
        candidates.truncate(max_candidates);
        candidates
    }
}

impl Default for EtaWeightedScoring {
    fn default() -> Self {
        Self::from_config(&MatchingConfig::default())
    }
}

/// Score, then pickup ETA, then straight-line distance, then driver id.
fn compare_candidates(a: &MatchCandidate, b: &MatchCandidate) -> Ordering {
    a.score
        .total_cmp(&b.score)
        .then_with(|| a.pickup_eta.duration_sec.cmp(&b.pickup_eta.duration_sec))
        .then_with(|| a.distance_m.total_cmp(&b.distance_m))
        .then_with(|| a.driver_id.cmp(&b.driver_id))
}
