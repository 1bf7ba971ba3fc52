//! Test helpers: fixture geography and in-memory collaborators.
//!
//! Shared by unit tests, integration tests, benches and the demo.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::DispatchConfig;
use crate::dispatch::{DispatchCollaborators, Dispatcher};
use crate::error::{DispatchError, Result};
use crate::geo::{Coordinate, EARTH_RADIUS_M};
use crate::ingest::LocationUpdate;
use crate::ports::{
    DriverOffer, EligibilitySource, NewRideRequest, NewTrip, Notifier, RequestId, RequestStatus,
    RideRepository, RiderStatus, RiderStatusKind, TripRecord,
};
use crate::presence::{DriverId, InMemoryPresenceStore};
use crate::routing::{FullRouteEta, HaversineRoutingOracle, RouteEta, RoutingOracle};

/// Kigali city centre; the default pickup point in tests.
pub const KIGALI_CENTER: Coordinate = Coordinate {
    lon: 30.0619,
    lat: -1.9441,
};

/// A drop-off roughly 5 km east of [`KIGALI_CENTER`].
pub const KIGALI_DESTINATION: Coordinate = Coordinate {
    lon: 30.1044,
    lat: -1.9536,
};

/// Point `meters` due north of `origin`.
pub fn north_of(origin: Coordinate, meters: f64) -> Coordinate {
    Coordinate {
        lat: origin.lat + (meters / EARTH_RADIUS_M).to_degrees(),
        lon: origin.lon,
    }
}

fn coordinate_key(at: &Coordinate) -> (i64, i64) {
    ((at.lat * 1e6).round() as i64, (at.lon * 1e6).round() as i64)
}

/// Records everything pushed to drivers and riders.
#[derive(Default)]
pub struct RecordingNotifier {
    offers: Mutex<Vec<(DriverId, DriverOffer)>>,
    statuses: Mutex<Vec<(String, RiderStatus)>>,
    unreachable: Mutex<HashSet<DriverId>>,
}

impl RecordingNotifier {
    /// Offers to this driver report "not connected" from now on.
    pub fn disconnect(&self, driver_id: &str) {
        self.unreachable.lock().insert(driver_id.to_string());
    }

    pub fn offers(&self) -> Vec<(DriverId, DriverOffer)> {
        self.offers.lock().clone()
    }

    pub fn offered_drivers(&self) -> Vec<DriverId> {
        self.offers.lock().iter().map(|(d, _)| d.clone()).collect()
    }

    pub fn statuses(&self) -> Vec<(String, RiderStatus)> {
        self.statuses.lock().clone()
    }

    /// Status kinds sent to `rider_id`, in order.
    pub fn status_kinds(&self, rider_id: &str) -> Vec<RiderStatusKind> {
        self.statuses
            .lock()
            .iter()
            .filter(|(rider, _)| rider == rider_id)
            .map(|(_, status)| status.status)
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_offer_to_driver(&self, driver_id: &str, offer: &DriverOffer) -> bool {
        if self.unreachable.lock().contains(driver_id) {
            return false;
        }
        self.offers.lock().push((driver_id.to_string(), offer.clone()));
        true
    }

    async fn send_status_to_rider(&self, rider_id: &str, status: &RiderStatus) {
        self.statuses
            .lock()
            .push((rider_id.to_string(), status.clone()));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRequest {
    pub request: NewRideRequest,
    pub status: RequestStatus,
}

/// Ride repository backed by hash maps.
#[derive(Default)]
pub struct InMemoryRideRepository {
    next_id: AtomicU64,
    requests: Mutex<HashMap<RequestId, StoredRequest>>,
    status_updates: Mutex<Vec<(RequestId, RequestStatus)>>,
    trips: Mutex<Vec<NewTrip>>,
    trip_attempts: AtomicUsize,
    fail_trip_creation: AtomicBool,
}

impl InMemoryRideRepository {
    pub fn fail_trip_creation(&self, fail: bool) {
        self.fail_trip_creation.store(fail, Ordering::SeqCst);
    }

    pub fn status(&self, request_id: &str) -> Option<RequestStatus> {
        self.requests.lock().get(request_id).map(|r| r.status)
    }

    pub fn status_updates(&self) -> Vec<(RequestId, RequestStatus)> {
        self.status_updates.lock().clone()
    }

    pub fn trips(&self) -> Vec<NewTrip> {
        self.trips.lock().clone()
    }

    /// Calls to `create_trip`, including failed ones.
    pub fn trip_attempts(&self) -> usize {
        self.trip_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RideRepository for InMemoryRideRepository {
    async fn create_request(&self, request: &NewRideRequest) -> Result<RequestId> {
        let id = format!("req-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.requests.lock().insert(
            id.clone(),
            StoredRequest {
                request: request.clone(),
                status: RequestStatus::Matching,
            },
        );
        Ok(id)
    }

    async fn update_request_status(&self, request_id: &str, status: RequestStatus) -> Result<()> {
        self.status_updates
            .lock()
            .push((request_id.to_string(), status));
        // Requests created outside the repository (direct `create`) are tracked too.
        let mut requests = self.requests.lock();
        match requests.get_mut(request_id) {
            Some(stored) => stored.status = status,
            None => {
                requests.insert(
                    request_id.to_string(),
                    StoredRequest {
                        request: NewRideRequest {
                            rider_id: String::new(),
                            origin: KIGALI_CENTER,
                            destination: KIGALI_DESTINATION,
                        },
                        status,
                    },
                );
            }
        }
        Ok(())
    }

    async fn create_trip(&self, trip: &NewTrip) -> Result<TripRecord> {
        let attempt = self.trip_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_trip_creation.load(Ordering::SeqCst) {
            return Err(DispatchError::Persistence("trip insert rejected".into()));
        }
        self.trips.lock().push(trip.clone());
        Ok(TripRecord {
            trip_id: format!("trip-{attempt}"),
            request_id: trip.request_id.clone(),
            driver_id: trip.driver_id.clone(),
        })
    }
}

/// Eligibility by allow-list; counts batch lookups.
#[derive(Default)]
pub struct StaticEligibility {
    allowed: Mutex<HashSet<DriverId>>,
    calls: AtomicUsize,
}

impl StaticEligibility {
    pub fn allow(&self, driver_id: &str) {
        self.allowed.lock().insert(driver_id.to_string());
    }

    /// E.g. the driver went busy or lost approval.
    pub fn deny(&self, driver_id: &str) {
        self.allowed.lock().remove(driver_id);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EligibilitySource for StaticEligibility {
    async fn find_eligible_driver_ids(
        &self,
        candidate_ids: &[DriverId],
    ) -> Result<HashSet<DriverId>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let allowed = self.allowed.lock();
        Ok(candidate_ids
            .iter()
            .filter(|id| allowed.contains(*id))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct Script {
    drivers_at: HashMap<(i64, i64), DriverId>,
    etas: HashMap<DriverId, FullRouteEta>,
    failing: HashSet<DriverId>,
    hanging: HashMap<DriverId, Duration>,
}

enum Scripted {
    Eta(FullRouteEta),
    Fail,
    Hang(Duration),
    Estimate,
}

/// Routing oracle with per-driver answers.
///
/// Drivers are recognised by the coordinate they were registered at. Drivers
/// without a script get a Haversine estimate.
#[derive(Default)]
pub struct ScriptedRoutingOracle {
    script: Mutex<Script>,
    outage: AtomicBool,
    calls: AtomicUsize,
    fallback: HaversineRoutingOracle,
}

impl ScriptedRoutingOracle {
    pub fn register_driver(&self, driver_id: &str, at: Coordinate) {
        self.script
            .lock()
            .drivers_at
            .insert(coordinate_key(&at), driver_id.to_string());
    }

    pub fn script(&self, driver_id: &str, eta: FullRouteEta) {
        self.script.lock().etas.insert(driver_id.to_string(), eta);
    }

    /// Non-outage failure for this driver's legs.
    pub fn fail_for(&self, driver_id: &str) {
        self.script.lock().failing.insert(driver_id.to_string());
    }

    /// Never answer for this driver within `delay`.
    pub fn hang_for(&self, driver_id: &str, delay: Duration) {
        self.script
            .lock()
            .hanging
            .insert(driver_id.to_string(), delay);
    }

    pub fn set_outage(&self, outage: bool) {
        self.outage.store(outage, Ordering::SeqCst);
    }

    /// `full_route_eta` calls served.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn lookup(&self, driver: &Coordinate) -> Scripted {
        let script = self.script.lock();
        let Some(driver_id) = script.drivers_at.get(&coordinate_key(driver)) else {
            return Scripted::Estimate;
        };
        if script.failing.contains(driver_id) {
            Scripted::Fail
        } else if let Some(delay) = script.hanging.get(driver_id) {
            Scripted::Hang(*delay)
        } else if let Some(eta) = script.etas.get(driver_id) {
            Scripted::Eta(*eta)
        } else {
            Scripted::Estimate
        }
    }
}

#[async_trait]
impl RoutingOracle for ScriptedRoutingOracle {
    async fn route(&self, from: Coordinate, to: Coordinate) -> Result<RouteEta> {
        if self.outage.load(Ordering::SeqCst) {
            return Err(DispatchError::RoutingUnavailable("scripted outage".into()));
        }
        self.fallback.route(from, to).await
    }

    async fn full_route_eta(
        &self,
        driver: Coordinate,
        origin: Coordinate,
        destination: Coordinate,
    ) -> Result<FullRouteEta> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.outage.load(Ordering::SeqCst) {
            return Err(DispatchError::RoutingUnavailable("scripted outage".into()));
        }
        match self.lookup(&driver) {
            Scripted::Eta(eta) => Ok(eta),
            Scripted::Fail => Err(DispatchError::RouteFailed("scripted failure".into())),
            Scripted::Hang(delay) => {
                tokio::time::sleep(delay).await;
                Err(DispatchError::RouteFailed("scripted hang elapsed".into()))
            }
            Scripted::Estimate => {
                let (pickup, trip) = tokio::try_join!(
                    self.fallback.route(driver, origin),
                    self.fallback.route(origin, destination)
                )?;
                Ok(FullRouteEta { pickup, trip })
            }
        }
    }
}

/// A fully wired dispatcher over in-memory collaborators.
pub struct TestStack {
    pub store: Arc<InMemoryPresenceStore>,
    pub eligibility: Arc<StaticEligibility>,
    pub oracle: Arc<ScriptedRoutingOracle>,
    pub repository: Arc<InMemoryRideRepository>,
    pub notifier: Arc<RecordingNotifier>,
    pub dispatcher: Dispatcher,
}

impl TestStack {
    pub fn new() -> Self {
        Self::with_config(&DispatchConfig::default())
    }

    /// # Panics
    ///
    /// Panics if `config` does not validate.
    pub fn with_config(config: &DispatchConfig) -> Self {
        let store = Arc::new(
            InMemoryPresenceStore::with_config(&config.presence).expect("valid presence config"),
        );
        let eligibility = Arc::new(StaticEligibility::default());
        let oracle = Arc::new(ScriptedRoutingOracle::default());
        let repository = Arc::new(InMemoryRideRepository::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = Dispatcher::from_config(
            config,
            DispatchCollaborators {
                presence: store.clone(),
                eligibility: eligibility.clone(),
                repository: repository.clone(),
                notifier: notifier.clone(),
                oracle: Some(oracle.clone()),
            },
        )
        .expect("valid dispatch config");
        Self {
            store,
            eligibility,
            oracle,
            repository,
            notifier,
            dispatcher,
        }
    }

    /// Put an eligible, connected driver `meters_north` of the pickup point.
    ///
    /// # Panics
    ///
    /// Panics if the location cannot be committed.
    pub async fn place_driver(&self, driver_id: &str, meters_north: f64) -> Coordinate {
        let at = north_of(KIGALI_CENTER, meters_north);
        self.dispatcher
            .ingest()
            .force_update_location(&LocationUpdate {
                driver_id: driver_id.to_string(),
                lat: at.lat,
                lon: at.lon,
                timestamp_ms: 0,
            })
            .await
            .expect("driver location committed");
        self.eligibility.allow(driver_id);
        self.oracle.register_driver(driver_id, at);
        at
    }

    /// Open a ride request from [`KIGALI_CENTER`] to [`KIGALI_DESTINATION`].
    ///
    /// # Panics
    ///
    /// Panics if the request cannot be created.
    pub async fn request_ride(&self, rider_id: &str) -> RequestId {
        self.dispatcher
            .create_ride_request(rider_id, KIGALI_CENTER, KIGALI_DESTINATION)
            .await
            .expect("ride request created")
            .request_id
    }
}

impl Default for TestStack {
    fn default() -> Self {
        Self::new()
    }
}
