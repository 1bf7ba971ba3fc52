//! Candidate search: proximity, one batched eligibility lookup, concurrent ETA
//! fan-out, weighted scoring.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures::future::try_join_all;
use tracing::{debug, warn};

use crate::config::MatchingConfig;
use crate::error::{DispatchError, Result};
use crate::geo::Coordinate;
use crate::ingest::LocationIngest;
use crate::ports::EligibilitySource;
use crate::presence::{DriverId, NearbyDriver};
use crate::routing::RoutingOracle;

use super::scoring::EtaWeightedScoring;
use super::types::{MatchCandidate, MatchRequest, MatchResult};

pub struct MatchingEngine {
    ingest: Arc<LocationIngest>,
    eligibility: Arc<dyn EligibilitySource>,
    oracle: Arc<dyn RoutingOracle>,
    scoring: EtaWeightedScoring,
    config: MatchingConfig,
}

impl MatchingEngine {
    pub fn new(
        ingest: Arc<LocationIngest>,
        eligibility: Arc<dyn EligibilitySource>,
        oracle: Arc<dyn RoutingOracle>,
        config: MatchingConfig,
    ) -> Self {
        Self {
            ingest,
            eligibility,
            oracle,
            scoring: EtaWeightedScoring::from_config(&config),
            config,
        }
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    /// Rank nearby eligible drivers for a pickup/destination pair.
    ///
    /// A routing outage fails the whole call; any other per-candidate routing
    /// failure drops that candidate.
    pub async fn find_matches(&self, request: &MatchRequest) -> Result<MatchResult> {
        let radius_m = request.radius_m.unwrap_or(self.config.default_radius_m);
        let ranked = self.ranked_candidates(request, radius_m, &[]).await?;
        Ok(MatchResult::from_ranked(ranked, radius_m))
    }

    /// Like [`find_matches`](Self::find_matches), retrying once at double the
    /// radius (capped at `max_radius_m`) when the first pass finds nobody.
    pub async fn find_matches_with_expansion(&self, request: &MatchRequest) -> Result<MatchResult> {
        let radius_m = request.radius_m.unwrap_or(self.config.default_radius_m);
        let first = self
            .find_matches(&request.clone().with_radius(radius_m))
            .await?;
        if !first.is_empty() || radius_m >= self.config.max_radius_m {
            return Ok(first);
        }

        let expanded_m = (radius_m * 2.0).min(self.config.max_radius_m);
        debug!(radius_m, expanded_m, "expanding search radius");
        self.find_matches(&request.clone().with_radius(expanded_m))
            .await
    }

    /// Best candidate not in `exclude`, recomputed from scratch.
    ///
    /// The proximity fetch is widened by the exclusion count so previously
    /// declined drivers cannot crowd out the remaining ones; excluded drivers
    /// never reach the eligibility source or the routing oracle.
    pub async fn get_next_candidate(
        &self,
        request: &MatchRequest,
        exclude: &[DriverId],
    ) -> Result<Option<MatchCandidate>> {
        let radius_m = request.radius_m.unwrap_or(self.config.default_radius_m);
        let ranked = self.ranked_candidates(request, radius_m, exclude).await?;
        Ok(ranked.into_iter().next())
    }

    /// At most `max_candidates * overfetch_factor` drivers are routed per pass.
    async fn ranked_candidates(
        &self,
        request: &MatchRequest,
        radius_m: f64,
        exclude: &[DriverId],
    ) -> Result<Vec<MatchCandidate>> {
        let started = Instant::now();
        request.destination.validate()?;
        let origin = request.origin;
        let max_candidates = request
            .max_candidates
            .unwrap_or(self.config.default_max_candidates);
        let fetch_limit = max_candidates.saturating_mul(self.config.overfetch_factor);

        let mut nearby = self
            .ingest
            .get_nearby_drivers(
                origin.lat,
                origin.lon,
                radius_m,
                fetch_limit.saturating_add(exclude.len()),
            )
            .await?;
        nearby.retain(|driver| !exclude.contains(&driver.driver_id));
        nearby.truncate(fetch_limit);
        if nearby.is_empty() {
            debug!(radius_m, "no nearby drivers");
            return Ok(Vec::new());
        }

        let available = self.filter_eligible(nearby).await?;
        if available.is_empty() {
            debug!(radius_m, "no eligible drivers among nearby");
            return Ok(Vec::new());
        }

        let estimates = available
            .into_iter()
            .map(|driver| self.estimate(driver, origin, request.destination));
        let candidates: Vec<MatchCandidate> =
            try_join_all(estimates).await?.into_iter().flatten().collect();
        let ranked = self.scoring.rank(candidates, max_candidates);

        debug!(
            radius_m,
            candidates = ranked.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "matching pass complete"
        );
        Ok(ranked)
    }

    /// One batched lookup for the whole candidate set.
    async fn filter_eligible(&self, nearby: Vec<NearbyDriver>) -> Result<Vec<NearbyDriver>> {
        let ids: Vec<DriverId> = nearby.iter().map(|d| d.driver_id.clone()).collect();
        let eligible: HashSet<DriverId> = self.eligibility.find_eligible_driver_ids(&ids).await?;
        Ok(nearby
            .into_iter()
            .filter(|d| eligible.contains(&d.driver_id))
            .collect())
    }

    /// `Ok(None)` drops the candidate; `Err` aborts the pass.
    async fn estimate(
        &self,
        driver: NearbyDriver,
        origin: Coordinate,
        destination: Coordinate,
    ) -> Result<Option<MatchCandidate>> {
        let timeout = self.config.routing_timeout();
        let lookup = self
            .oracle
            .full_route_eta(driver.coordinate, origin, destination);
        let eta = match tokio::time::timeout(timeout, lookup).await {
            Err(_) => {
                return Err(DispatchError::RoutingUnavailable(format!(
                    "routing oracle did not answer within {} ms",
                    timeout.as_millis()
                )))
            }
            Ok(Err(err)) if err.is_routing_outage() => return Err(err),
            Ok(Err(err)) => {
                warn!(driver_id = %driver.driver_id, error = %err, "failed to calculate ETA; dropping candidate");
                return Ok(None);
            }
            Ok(Ok(eta)) => eta,
        };

        Ok(Some(MatchCandidate {
            score: self.scoring.score(&eta),
            driver_id: driver.driver_id,
            distance_m: driver.distance_m,
            coordinate: driver.coordinate,
            pickup_eta: eta.pickup,
            trip_eta: eta.trip,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;
    use crate::ingest::LocationUpdate;
    use crate::presence::InMemoryPresenceStore;
    use crate::routing::{FullRouteEta, RouteEta};
    use crate::test_helpers::{
        north_of, ScriptedRoutingOracle, StaticEligibility, KIGALI_CENTER, KIGALI_DESTINATION,
    };
    use std::time::Duration;

    struct Fixture {
        ingest: Arc<LocationIngest>,
        eligibility: Arc<StaticEligibility>,
        oracle: Arc<ScriptedRoutingOracle>,
        engine: MatchingEngine,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryPresenceStore::new());
        let ingest = Arc::new(LocationIngest::new(store, IngestConfig::default()));
        let eligibility = Arc::new(StaticEligibility::default());
        let oracle = Arc::new(ScriptedRoutingOracle::default());
        let engine = MatchingEngine::new(
            ingest.clone(),
            eligibility.clone(),
            oracle.clone(),
            MatchingConfig::default(),
        );
        Fixture {
            ingest,
            eligibility,
            oracle,
            engine,
        }
    }

    impl Fixture {
        async fn place(&self, driver_id: &str, meters_north: f64) {
            let at = north_of(KIGALI_CENTER, meters_north);
            self.ingest
                .force_update_location(&LocationUpdate {
                    driver_id: driver_id.into(),
                    lat: at.lat,
                    lon: at.lon,
                    timestamp_ms: 0,
                })
                .await
                .unwrap();
            self.eligibility.allow(driver_id);
            self.oracle.register_driver(driver_id, at);
        }
    }

    fn legs(pickup: u64, trip: u64) -> FullRouteEta {
        FullRouteEta {
            pickup: RouteEta { duration_sec: pickup, distance_m: pickup * 10 },
            trip: RouteEta { duration_sec: trip, distance_m: trip * 10 },
        }
    }

    fn request() -> MatchRequest {
        MatchRequest::new(KIGALI_CENTER, KIGALI_DESTINATION)
    }

    #[tokio::test]
    async fn no_nearby_drivers_yields_empty_result() {
        let fx = fixture();
        let result = fx.engine.find_matches(&request()).await.unwrap();
        assert!(result.candidates.is_empty());
        assert!(result.best_match.is_none());
        assert_eq!(fx.eligibility.calls(), 0);
    }

    #[tokio::test]
    async fn lower_weighted_score_wins() {
        let fx = fixture();
        fx.place("a", 500.0).await;
        fx.place("b", 900.0).await;
        fx.oracle.script("a", legs(300, 600));
        fx.oracle.script("b", legs(200, 800));

        let result = fx.engine.find_matches(&request()).await.unwrap();
        let scores: Vec<f64> = result.candidates.iter().map(|c| c.score).collect();
        assert_eq!(scores, vec![380.0, 390.0]);
        assert_eq!(result.best_match.unwrap().driver_id, "b");
    }

    #[tokio::test]
    async fn ineligible_drivers_are_filtered_in_one_lookup() {
        let fx = fixture();
        fx.place("a", 500.0).await;
        fx.place("busy", 200.0).await;
        fx.eligibility.deny("busy");

        let result = fx.engine.find_matches(&request()).await.unwrap();
        let ids: Vec<_> = result.candidates.iter().map(|c| c.driver_id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
        assert_eq!(fx.eligibility.calls(), 1);
    }

    #[tokio::test]
    async fn per_candidate_failure_drops_only_that_candidate() {
        let fx = fixture();
        fx.place("a", 500.0).await;
        fx.place("b", 900.0).await;
        fx.oracle.fail_for("a");

        let result = fx.engine.find_matches(&request()).await.unwrap();
        let ids: Vec<_> = result.candidates.iter().map(|c| c.driver_id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[tokio::test]
    async fn outage_aborts_the_pass() {
        let fx = fixture();
        fx.place("a", 500.0).await;
        fx.oracle.set_outage(true);

        let err = fx.engine.find_matches(&request()).await.unwrap_err();
        assert!(err.is_routing_outage());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_oracle_is_bounded_by_routing_timeout() {
        let fx = fixture();
        fx.place("a", 500.0).await;
        fx.oracle.hang_for("a", Duration::from_secs(3_600));

        let err = fx.engine.find_matches(&request()).await.unwrap_err();
        assert!(err.is_routing_outage());
    }

    #[tokio::test]
    async fn expansion_doubles_radius_once() {
        let fx = fixture();
        fx.place("far", 8_000.0).await;

        let plain = fx.engine.find_matches(&request()).await.unwrap();
        assert!(plain.is_empty());

        let expanded = fx.engine.find_matches_with_expansion(&request()).await.unwrap();
        assert_eq!(expanded.radius_m, 10_000.0);
        assert_eq!(expanded.best_match.unwrap().driver_id, "far");
    }

    #[tokio::test]
    async fn expansion_is_capped_at_max_radius() {
        let fx = fixture();
        fx.place("very_far", 14_000.0).await;

        let result = fx
            .engine
            .find_matches_with_expansion(&request().with_radius(9_000.0))
            .await
            .unwrap();
        assert_eq!(result.radius_m, 15_000.0);
        assert_eq!(result.candidates.len(), 1);

        let none = fx
            .engine
            .find_matches_with_expansion(&request().with_radius(15_000.0))
            .await
            .unwrap();
        assert_eq!(none.radius_m, 15_000.0);
    }

    #[tokio::test]
    async fn next_candidate_skips_exclusions() {
        let fx = fixture();
        fx.place("a", 100.0).await;
        fx.place("b", 200.0).await;
        fx.oracle.script("a", legs(100, 600));
        fx.oracle.script("b", legs(200, 600));

        let next = fx
            .engine
            .get_next_candidate(&request(), &["a".to_string()])
            .await
            .unwrap();
        assert_eq!(next.unwrap().driver_id, "b");

        let none = fx
            .engine
            .get_next_candidate(&request(), &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn exclusions_do_not_crowd_out_remaining_drivers() {
        let fx = fixture();
        // Ten better-ranked drivers, all excluded, and one more behind them.
        let mut excluded = Vec::new();
        for i in 0..10 {
            let id = format!("x{i}");
            fx.place(&id, 100.0 + i as f64 * 10.0).await;
            fx.oracle.script(&id, legs(10 + i, 100));
            excluded.push(id);
        }
        fx.place("last", 3_000.0).await;
        fx.oracle.script("last", legs(900, 100));

        let next = fx
            .engine
            .get_next_candidate(&request(), &excluded)
            .await
            .unwrap();
        assert_eq!(next.unwrap().driver_id, "last");
    }

    #[tokio::test]
    async fn excluded_drivers_are_never_routed() {
        let fx = fixture();
        let mut excluded = Vec::new();
        for i in 0..20 {
            let id = format!("x{i}");
            fx.place(&id, 100.0 + i as f64 * 10.0).await;
            excluded.push(id);
        }
        fx.place("last", 3_000.0).await;

        let next = fx
            .engine
            .get_next_candidate(&request(), &excluded)
            .await
            .unwrap();
        assert_eq!(next.unwrap().driver_id, "last");
        assert_eq!(fx.oracle.calls(), 1);
    }

    #[tokio::test]
    async fn routing_calls_per_pass_are_bounded_by_overfetch() {
        let fx = fixture();
        let mut excluded = Vec::new();
        for i in 0..8 {
            let id = format!("x{i}");
            fx.place(&id, 100.0 + i as f64 * 10.0).await;
            excluded.push(id);
        }
        for i in 0..30 {
            fx.place(&format!("d{i}"), 1_000.0 + i as f64 * 50.0).await;
        }

        let config = MatchingConfig::default();
        let limit = config.default_max_candidates * config.overfetch_factor;
        fx.engine
            .get_next_candidate(&request(), &excluded)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fx.oracle.calls(), limit);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_oracle_for_excluded_driver_does_not_abort_pass() {
        let fx = fixture();
        fx.place("declined", 100.0).await;
        fx.place("b", 900.0).await;
        fx.oracle.hang_for("declined", Duration::from_secs(3_600));

        let next = fx
            .engine
            .get_next_candidate(&request(), &["declined".to_string()])
            .await
            .unwrap();
        assert_eq!(next.unwrap().driver_id, "b");
    }

    #[tokio::test]
    async fn overfetch_survives_ineligible_nearest_drivers() {
        let fx = fixture();
        for i in 0..5 {
            let id = format!("busy{i}");
            fx.place(&id, 100.0 + i as f64 * 10.0).await;
            fx.eligibility.deny(&id);
        }
        for i in 0..5 {
            fx.place(&format!("free{i}"), 1_000.0 + i as f64 * 100.0).await;
        }

        let result = fx.engine.find_matches(&request()).await.unwrap();
        assert_eq!(result.candidates.len(), 5);
        assert!(result
            .candidates
            .iter()
            .all(|c| c.driver_id.starts_with("free")));
    }
}
