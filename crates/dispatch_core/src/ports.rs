//! Collaborators the dispatch core consumes: persistence, driver eligibility
//! and the push transport. Implementations live outside this crate (the
//! `test_helpers` module ships in-memory ones).

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::geo::Coordinate;
use crate::presence::DriverId;

pub type RequestId = String;
pub type RiderId = String;

/// Persisted lifecycle status of a ride request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Matching,
    Matched,
    Expired,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRideRequest {
    pub rider_id: RiderId,
    pub origin: Coordinate,
    pub destination: Coordinate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTrip {
    pub request_id: RequestId,
    pub rider_id: RiderId,
    pub driver_id: DriverId,
    pub origin: Coordinate,
    pub destination: Coordinate,
    pub pickup_eta_sec: u64,
    pub trip_eta_sec: u64,
    /// Pickup leg plus trip leg.
    pub distance_m: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripRecord {
    pub trip_id: String,
    pub request_id: RequestId,
    pub driver_id: DriverId,
}

#[async_trait]
pub trait RideRepository: Send + Sync {
    /// Persist a new request in `matching` status and return its id.
    async fn create_request(&self, request: &NewRideRequest) -> Result<RequestId>;

    async fn update_request_status(&self, request_id: &str, status: RequestStatus) -> Result<()>;

    async fn create_trip(&self, trip: &NewTrip) -> Result<TripRecord>;
}

#[async_trait]
pub trait EligibilitySource: Send + Sync {
    /// The subset of `candidate_ids` that is online, approved and not engaged.
    /// Always one call per matching pass.
    async fn find_eligible_driver_ids(&self, candidate_ids: &[DriverId])
        -> Result<HashSet<DriverId>>;
}

/// Offer pushed to exactly one driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "driver.offer")]
pub struct DriverOffer {
    pub request_id: RequestId,
    pub origin: Coordinate,
    pub destination: Coordinate,
    pub pickup_eta_sec: u64,
    pub trip_eta_sec: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiderStatusKind {
    Matching,
    Matched,
    NoDrivers,
    DriverDeclined,
    TripStarted,
    TripCompleted,
}

/// Status update pushed to a rider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "rider.status")]
pub struct RiderStatus {
    pub request_id: RequestId,
    pub status: RiderStatusKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trip_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<DriverId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pickup_eta_sec: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RiderStatus {
    pub fn new(request_id: impl Into<RequestId>, status: RiderStatusKind) -> Self {
        Self {
            request_id: request_id.into(),
            status,
            trip_id: None,
            driver_id: None,
            pickup_eta_sec: None,
            message: None,
        }
    }

    pub fn matched(
        request_id: impl Into<RequestId>,
        trip_id: impl Into<String>,
        driver_id: impl Into<DriverId>,
        pickup_eta_sec: u64,
    ) -> Self {
        Self {
            trip_id: Some(trip_id.into()),
            driver_id: Some(driver_id.into()),
            pickup_eta_sec: Some(pickup_eta_sec),
            ..Self::new(request_id, RiderStatusKind::Matched)
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Push transport to connected drivers and riders.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Returns `false` when the driver is not connected.
    async fn send_offer_to_driver(&self, driver_id: &str, offer: &DriverOffer) -> bool;

    async fn send_status_to_rider(&self, rider_id: &str, status: &RiderStatus);
}
