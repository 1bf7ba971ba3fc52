use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::geo::Coordinate;
use crate::matching::{MatchCandidate, MatchRequest};
use crate::ports::{RequestId, RiderId};
use crate::presence::DriverId;

/// Lifecycle of one pending request.
///
/// `Matching -> Offered -> {Offered | Bound | Exhausted}`, with `Canceled`
/// reachable from `Matching` or `Offered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Matching,
    Offered,
    Bound,
    Exhausted,
    Canceled,
}

impl DispatchState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DispatchState::Bound | DispatchState::Exhausted | DispatchState::Canceled
        )
    }
}

/// Guarded per-request record. Only touched under the request's mutex.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub request_id: RequestId,
    pub rider_id: RiderId,
    pub origin: Coordinate,
    pub destination: Coordinate,
    pub state: DispatchState,
    /// Radius that produced the first match; later searches reuse it.
    pub search_radius_m: Option<f64>,
    pub current_driver: Option<MatchCandidate>,
    /// Drivers who declined, timed out or were unreachable. Only grows.
    pub declined: Vec<DriverId>,
    pub offer_timer: Option<JoinHandle<()>>,
}

impl PendingRequest {
    pub fn new(
        request_id: RequestId,
        rider_id: RiderId,
        origin: Coordinate,
        destination: Coordinate,
    ) -> Self {
        Self {
            request_id,
            rider_id,
            origin,
            destination,
            state: DispatchState::Matching,
            search_radius_m: None,
            current_driver: None,
            declined: Vec::new(),
            offer_timer: None,
        }
    }

    pub fn match_request(&self) -> MatchRequest {
        let request = MatchRequest::new(self.origin, self.destination);
        match self.search_radius_m {
            Some(radius_m) => request.with_radius(radius_m),
            None => request,
        }
    }

    pub fn holds_offer(&self, driver_id: &str) -> bool {
        !self.state.is_terminal()
            && self
                .current_driver
                .as_ref()
                .is_some_and(|candidate| candidate.driver_id == driver_id)
    }

    /// Abort the armed timer, if any. Safe to call repeatedly.
    pub fn cancel_timer(&mut self) {
        if let Some(handle) = self.offer_timer.take() {
            handle.abort();
        }
    }

    /// Move the current driver into the declined set and clear the offer.
    pub fn retire_current(&mut self) -> Option<DriverId> {
        let candidate = self.current_driver.take()?;
        if !self.declined.contains(&candidate.driver_id) {
            self.declined.push(candidate.driver_id.clone());
        }
        self.state = DispatchState::Matching;
        Some(candidate.driver_id)
    }

    pub fn finish(&mut self, state: DispatchState) {
        self.cancel_timer();
        self.current_driver = None;
        self.state = state;
    }

    pub fn snapshot(&self) -> PendingSnapshot {
        PendingSnapshot {
            request_id: self.request_id.clone(),
            rider_id: self.rider_id.clone(),
            state: self.state,
            current_driver: self
                .current_driver
                .as_ref()
                .map(|candidate| candidate.driver_id.clone()),
            declined: self.declined.clone(),
            search_radius_m: self.search_radius_m,
            offer_armed: self.offer_timer.is_some(),
        }
    }
}

/// Read-only view of a pending request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSnapshot {
    pub request_id: RequestId,
    pub rider_id: RiderId,
    pub state: DispatchState,
    pub current_driver: Option<DriverId>,
    pub declined: Vec<DriverId>,
    pub search_radius_m: Option<f64>,
    pub offer_armed: bool,
}
