//! Per-request dispatch state machine.
//!
//! The pending table maps request ids to individually locked records. The
//! table lock is only held to look up, insert or remove an entry; every
//! transition runs under the request's own `tokio::sync::Mutex`, so accept,
//! decline, timeout, disconnect and cancel for one request are serialized
//! while different requests proceed in parallel.
//!
//! Terminal transitions remove the entry and mark the record terminal, so a
//! handler that cloned the entry before removal observes the terminal state
//! and does nothing.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use crate::config::{DispatchConfig, DispatchTimingConfig};
use crate::error::{DispatchError, Result};
use crate::geo::Coordinate;
use crate::ingest::{LocationIngest, LocationUpdate, LocationUpdateResult};
use crate::matching::{MatchCandidate, MatchRequest, MatchingEngine};
use crate::ports::{
    DriverOffer, EligibilitySource, NewRideRequest, NewTrip, Notifier, RequestId, RequestStatus,
    RideRepository, RiderStatus, RiderStatusKind, TripRecord,
};
use crate::presence::PresenceStore;
use crate::routing::{build_routing_oracle, RoutingOracle};
use crate::telemetry::DispatchTelemetry;

use super::state::{DispatchState, PendingRequest, PendingSnapshot};

type SharedRequest = Arc<AsyncMutex<PendingRequest>>;

const DECLINED_MESSAGE: &str = "Driver unavailable, finding another driver...";

/// External services a [`Dispatcher`] is wired to.
pub struct DispatchCollaborators {
    pub presence: Arc<dyn PresenceStore>,
    pub eligibility: Arc<dyn EligibilitySource>,
    pub repository: Arc<dyn RideRepository>,
    pub notifier: Arc<dyn Notifier>,
    /// Overrides the oracle built from `RoutingConfig`.
    pub oracle: Option<Arc<dyn RoutingOracle>>,
}

/// Returned to the caller that opened a ride request.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RideRequestTicket {
    pub request_id: RequestId,
    pub status: RequestStatus,
    /// Where dispatch stood when the call returned.
    pub dispatch_state: DispatchState,
}

struct DispatcherInner {
    ingest: Arc<LocationIngest>,
    matching: Arc<MatchingEngine>,
    repository: Arc<dyn RideRepository>,
    notifier: Arc<dyn Notifier>,
    telemetry: Arc<DispatchTelemetry>,
    timing: DispatchTimingConfig,
    pending: Mutex<HashMap<RequestId, SharedRequest>>,
}

/// Cheap to clone; clones share the same pending table.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(
        ingest: Arc<LocationIngest>,
        matching: Arc<MatchingEngine>,
        repository: Arc<dyn RideRepository>,
        notifier: Arc<dyn Notifier>,
        timing: DispatchTimingConfig,
        telemetry: Arc<DispatchTelemetry>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                ingest,
                matching,
                repository,
                notifier,
                telemetry,
                timing,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Wire ingest, matching and dispatch from one configuration.
    pub fn from_config(config: &DispatchConfig, parts: DispatchCollaborators) -> Result<Self> {
        config.validate()?;
        let telemetry = Arc::new(DispatchTelemetry::default());
        let ingest = Arc::new(LocationIngest::with_telemetry(
            parts.presence,
            config.ingest.clone(),
            telemetry.clone(),
        ));
        let oracle = match parts.oracle {
            Some(oracle) => oracle,
            None => build_routing_oracle(&config.routing)?,
        };
        let matching = Arc::new(MatchingEngine::new(
            ingest.clone(),
            parts.eligibility,
            oracle,
            config.matching.clone(),
        ));
        Ok(Self::new(
            ingest,
            matching,
            parts.repository,
            parts.notifier,
            config.timing.clone(),
            telemetry,
        ))
    }

    pub fn ingest(&self) -> &Arc<LocationIngest> {
        &self.inner.ingest
    }

    pub fn matching(&self) -> &Arc<MatchingEngine> {
        &self.inner.matching
    }

    pub fn telemetry(&self) -> &Arc<DispatchTelemetry> {
        &self.inner.telemetry
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub async fn pending_snapshot(&self, request_id: &str) -> Option<PendingSnapshot> {
        let entry = self.entry(request_id)?;
        let req = entry.lock().await;
        Some(req.snapshot())
    }

    /// Persist a new request and start dispatching it.
    pub async fn create_ride_request(
        &self,
        rider_id: &str,
        origin: Coordinate,
        destination: Coordinate,
    ) -> Result<RideRequestTicket> {
        origin.validate()?;
        destination.validate()?;
        let request_id = self
            .inner
            .repository
            .create_request(&NewRideRequest {
                rider_id: rider_id.to_string(),
                origin,
                destination,
            })
            .await?;
        info!(request_id = %request_id, rider_id, "created ride request");

        let dispatch_state = self
            .create(&request_id, rider_id, origin, destination)
            .await?;
        Ok(RideRequestTicket {
            request_id,
            status: RequestStatus::Matching,
            dispatch_state,
        })
    }

    /// Register a pending request and offer it to the best match, expanding
    /// the search radius once if nobody is nearby.
    ///
    /// Returns the state the request reached: `Offered`, or `Exhausted` when
    /// no driver could be reached.
    pub async fn create(
        &self,
        request_id: &str,
        rider_id: &str,
        origin: Coordinate,
        destination: Coordinate,
    ) -> Result<DispatchState> {
        let entry: SharedRequest = Arc::new(AsyncMutex::new(PendingRequest::new(
            request_id.to_string(),
            rider_id.to_string(),
            origin,
            destination,
        )));
        // Lock before publishing so no handler sees the record mid-match.
        let mut req = entry.lock().await;
        {
            let mut pending = self.inner.pending.lock();
            if pending.contains_key(request_id) {
                return Err(DispatchError::RequestAlreadyPending(request_id.to_string()));
            }
            pending.insert(request_id.to_string(), entry.clone());
        }

        let search = self
            .inner
            .matching
            .find_matches_with_expansion(&MatchRequest::new(origin, destination))
            .await;
        match search {
            Ok(result) => match result.best_match {
                Some(best) => {
                    req.search_radius_m = Some(result.radius_m);
                    self.offer(&mut req, best).await;
                }
                None => {
                    info!(request_id, radius_m = result.radius_m, "no drivers found");
                    self.exhaust(&mut req).await;
                }
            },
            Err(err) => {
                error!(request_id, error = %err, "matching failed; expiring request");
                self.exhaust(&mut req).await;
            }
        }
        Ok(req.state)
    }

    /// Bind the request to `driver_id` if it holds the open offer.
    ///
    /// Returns `Ok(None)` without side effects for unknown requests and for
    /// drivers that do not hold the offer. A failed trip creation counts as a
    /// decline: the request moves on and the error is returned.
    pub async fn handle_accept(
        &self,
        request_id: &str,
        driver_id: &str,
    ) -> Result<Option<TripRecord>> {
        let Some(entry) = self.entry(request_id) else {
            warn!(request_id, driver_id, "accept for unknown or resolved request");
            return Ok(None);
        };
        let mut req = entry.lock().await;
        if !req.holds_offer(driver_id) {
            warn!(request_id, driver_id, "accept from driver not holding the offer");
            return Ok(None);
        }
        req.cancel_timer();

        let Some(candidate) = req.current_driver.clone() else {
            return Ok(None);
        };
        let new_trip = NewTrip {
            request_id: req.request_id.clone(),
            rider_id: req.rider_id.clone(),
            driver_id: candidate.driver_id.clone(),
            origin: req.origin,
            destination: req.destination,
            pickup_eta_sec: candidate.pickup_eta.duration_sec,
            trip_eta_sec: candidate.trip_eta.duration_sec,
            distance_m: candidate.pickup_eta.distance_m + candidate.trip_eta.distance_m,
        };
        let trip = match self.inner.repository.create_trip(&new_trip).await {
            Ok(trip) => trip,
            Err(err) => {
                error!(request_id, driver_id, error = %err, "trip creation failed; treating as decline");
                self.retire_offer(&mut req, RiderStatusKind::DriverDeclined)
                    .await;
                return Err(err);
            }
        };

        if let Err(err) = self
            .inner
            .repository
            .update_request_status(request_id, RequestStatus::Matched)
            .await
        {
            error!(request_id, error = %err, "failed to persist matched status");
        }
        let status = RiderStatus::matched(
            request_id,
            trip.trip_id.clone(),
            driver_id,
            candidate.pickup_eta.duration_sec,
        );
        self.inner
            .notifier
            .send_status_to_rider(&req.rider_id, &status)
            .await;

        req.finish(DispatchState::Bound);
        self.remove(request_id);
        self.inner.telemetry.record_request_bound();
        info!(request_id, driver_id, trip_id = %trip.trip_id, "request bound");
        Ok(Some(trip))
    }

    /// Returns `true` if the decline was applied. Declines from drivers not
    /// holding the offer are ignored.
    pub async fn handle_decline(&self, request_id: &str, driver_id: &str) -> bool {
        let Some(entry) = self.entry(request_id) else {
            return false;
        };
        let mut req = entry.lock().await;
        if !req.holds_offer(driver_id) {
            return false;
        }
        info!(request_id, driver_id, "driver declined");
        self.inner.telemetry.record_offer_declined();
        self.retire_offer(&mut req, RiderStatusKind::DriverDeclined)
            .await;
        true
    }

    /// Expire the open offer held by `driver_id`. Fired by the offer timer;
    /// also callable by a transport that tracks its own deadlines.
    pub async fn handle_timeout(&self, request_id: &str, driver_id: &str) -> bool {
        self.expire_offer(request_id, driver_id, false).await
    }

    async fn expire_offer(&self, request_id: &str, driver_id: &str, from_timer: bool) -> bool {
        let Some(entry) = self.entry(request_id) else {
            return false;
        };
        let mut req = entry.lock().await;
        if !req.holds_offer(driver_id) {
            return false;
        }
        if from_timer {
            // This task is the timer; detach instead of aborting itself.
            req.offer_timer = None;
        }
        info!(request_id, driver_id, "driver timed out");
        self.inner.telemetry.record_offer_timed_out();
        self.retire_offer(&mut req, RiderStatusKind::Matching).await;
        true
    }

    /// Cancel on behalf of the owning rider.
    ///
    /// `Ok(false)` when the request is not pending (already bound, exhausted
    /// or canceled, or unknown).
    pub async fn cancel(&self, request_id: &str, caller_id: &str) -> Result<bool> {
        let Some(entry) = self.entry(request_id) else {
            return Ok(false);
        };
        let mut req = entry.lock().await;
        if req.state.is_terminal() {
            return Ok(false);
        }
        if req.rider_id != caller_id {
            return Err(DispatchError::NotRequestOwner {
                request_id: request_id.to_string(),
                caller_id: caller_id.to_string(),
            });
        }

        req.finish(DispatchState::Canceled);
        self.remove(request_id);
        self.inner.telemetry.record_request_canceled();
        info!(request_id, "request canceled");
        self.inner
            .repository
            .update_request_status(request_id, RequestStatus::Canceled)
            .await?;
        Ok(true)
    }

    /// Transport entry point for driver position reports.
    pub async fn handle_location_update(
        &self,
        update: &LocationUpdate,
    ) -> Result<LocationUpdateResult> {
        self.inner.ingest.update_location(update).await
    }

    /// Transport entry point for a dropped driver connection: the driver leaves
    /// the proximity index and any offer it holds is declined immediately.
    pub async fn handle_driver_disconnected(&self, driver_id: &str) -> Result<()> {
        self.inner.ingest.remove_driver_location(driver_id).await?;

        let entries: Vec<SharedRequest> = self.inner.pending.lock().values().cloned().collect();
        for entry in entries {
            let mut req = entry.lock().await;
            if !req.holds_offer(driver_id) {
                continue;
            }
            info!(request_id = %req.request_id, driver_id, "offered driver disconnected");
            self.inner.telemetry.record_offer_declined();
            self.retire_offer(&mut req, RiderStatusKind::DriverDeclined)
                .await;
        }
        Ok(())
    }

    fn entry(&self, request_id: &str) -> Option<SharedRequest> {
        self.inner.pending.lock().get(request_id).cloned()
    }

    fn remove(&self, request_id: &str) {
        self.inner.pending.lock().remove(request_id);
    }

    /// Decline/timeout common path: retire the current driver, tell the rider
    /// and move on.
    async fn retire_offer(&self, req: &mut PendingRequest, rider_status: RiderStatusKind) {
        req.cancel_timer();
        req.retire_current();

        let mut status = RiderStatus::new(req.request_id.clone(), rider_status);
        if rider_status == RiderStatusKind::DriverDeclined {
            status = status.with_message(DECLINED_MESSAGE);
        }
        self.inner
            .notifier
            .send_status_to_rider(&req.rider_id, &status)
            .await;

        match self.next_candidate(req).await {
            Some(next) => self.offer(req, next).await,
            None => self.exhaust(req).await,
        }
    }

    /// Offer to `candidate`; unreachable drivers count as immediate declines
    /// and the next candidate is tried without arming a timer.
    async fn offer(&self, req: &mut PendingRequest, mut candidate: MatchCandidate) {
        loop {
            req.cancel_timer();
            req.current_driver = Some(candidate.clone());
            req.state = DispatchState::Offered;

            let offer = DriverOffer {
                request_id: req.request_id.clone(),
                origin: req.origin,
                destination: req.destination,
                pickup_eta_sec: candidate.pickup_eta.duration_sec,
                trip_eta_sec: candidate.trip_eta.duration_sec,
            };
            if self
                .inner
                .notifier
                .send_offer_to_driver(&candidate.driver_id, &offer)
                .await
            {
                self.arm_offer_timer(req, &candidate.driver_id);
                self.inner.telemetry.record_offer_sent();
                info!(
                    request_id = %req.request_id,
                    driver_id = %candidate.driver_id,
                    pickup_eta_sec = candidate.pickup_eta.duration_sec,
                    "sent offer"
                );
                return;
            }

            warn!(
                request_id = %req.request_id,
                driver_id = %candidate.driver_id,
                "driver not connected; trying next"
            );
            self.inner.telemetry.record_offer_undeliverable();
            req.retire_current();
            match self.next_candidate(req).await {
                Some(next) => candidate = next,
                None => {
                    self.exhaust(req).await;
                    return;
                }
            }
        }
    }

    fn arm_offer_timer(&self, req: &mut PendingRequest, driver_id: &str) {
        let dispatcher = self.clone();
        let request_id = req.request_id.clone();
        let driver_id = driver_id.to_string();
        let timeout = self.inner.timing.offer_timeout();
        req.offer_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            dispatcher.expire_offer(&request_id, &driver_id, true).await;
        }));
    }

    async fn next_candidate(&self, req: &PendingRequest) -> Option<MatchCandidate> {
        match self
            .inner
            .matching
            .get_next_candidate(&req.match_request(), &req.declined)
            .await
        {
            Ok(next) => next,
            Err(err) => {
                error!(request_id = %req.request_id, error = %err, "matching failed; expiring request");
                None
            }
        }
    }

    async fn exhaust(&self, req: &mut PendingRequest) {
        req.finish(DispatchState::Exhausted);
        self.remove(&req.request_id);
        self.inner.telemetry.record_request_exhausted();

        if let Err(err) = self
            .inner
            .repository
            .update_request_status(&req.request_id, RequestStatus::Expired)
            .await
        {
            error!(request_id = %req.request_id, error = %err, "failed to persist expired status");
        }
        let status = RiderStatus::new(req.request_id.clone(), RiderStatusKind::NoDrivers);
        self.inner
            .notifier
            .send_status_to_rider(&req.rider_id, &status)
            .await;
        info!(request_id = %req.request_id, declined = req.declined.len(), "request exhausted");
    }
}
