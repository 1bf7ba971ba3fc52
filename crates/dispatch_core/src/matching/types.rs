use serde::{Deserialize, Serialize};

use crate::geo::Coordinate;
use crate::presence::DriverId;
use crate::routing::RouteEta;

/// Input to a matching pass. Unset fields take the configured defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRequest {
    pub origin: Coordinate,
    pub destination: Coordinate,
    #[serde(default)]
    pub radius_m: Option<f64>,
    #[serde(default)]
    pub max_candidates: Option<usize>,
}

impl MatchRequest {
    pub fn new(origin: Coordinate, destination: Coordinate) -> Self {
        Self {
            origin,
            destination,
            radius_m: None,
            max_candidates: None,
        }
    }

    pub fn with_radius(mut self, radius_m: f64) -> Self {
        self.radius_m = Some(radius_m);
        self
    }

    pub fn with_max_candidates(mut self, max_candidates: usize) -> Self {
        self.max_candidates = Some(max_candidates);
        self
    }
}

/// A driver considered for one request, with both ETA legs and its score.
/// Recomputed on every matching pass, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub driver_id: DriverId,
    /// Straight-line distance from the pickup origin.
    pub distance_m: f64,
    pub coordinate: Coordinate,
    pub pickup_eta: RouteEta,
    pub trip_eta: RouteEta,
    /// Lower is better.
    pub score: f64,
}

/// Ranked output of a matching pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub candidates: Vec<MatchCandidate>,
    pub best_match: Option<MatchCandidate>,
    /// Radius the candidates were found at (after any expansion).
    pub radius_m: f64,
}

impl MatchResult {
    /// Wrap candidates that are already sorted best-first.
    pub fn from_ranked(candidates: Vec<MatchCandidate>, radius_m: f64) -> Self {
        Self {
            best_match: candidates.first().cloned(),
            candidates,
            radius_m,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}
