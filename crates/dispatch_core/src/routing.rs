//! Pluggable routing oracles: ETA and distance for a single leg or a full
//! pickup + trip route.
//!
//! Implementations, selectable via [`RoutingOracleKind`]:
//!
//! - **`HaversineRoutingOracle`**: straight-line distance at a fixed average speed. No I/O.
//! - **`OsrmRoutingOracle`** (feature `osrm`): calls an OSRM HTTP endpoint.
//!
//! Remote oracles are wrapped in a [`CachedRoutingOracle`] by [`build_routing_oracle`].

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{RoutingConfig, RoutingOracleKind};
use crate::error::Result;
use crate::geo::{haversine_m, Coordinate};

#[cfg(feature = "osrm")]
pub mod osrm;

/// One route leg, rounded to whole seconds and meters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEta {
    pub duration_sec: u64,
    pub distance_m: u64,
}

impl RouteEta {
    /// Round raw oracle output (negative or non-finite input reads as zero).
    pub fn from_raw(duration_sec: f64, distance_m: f64) -> Self {
        Self {
            duration_sec: round_non_negative(duration_sec),
            distance_m: round_non_negative(distance_m),
        }
    }
}

fn round_non_negative(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value.round() as u64
    } else {
        0
    }
}

/// Pickup leg (driver to origin) and trip leg (origin to destination).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullRouteEta {
    pub pickup: RouteEta,
    pub trip: RouteEta,
}

/// Trait for routing backends.
///
/// Outages must surface as [`DispatchError::RoutingUnavailable`]; anything
/// else is treated as a per-route failure by callers.
///
/// [`DispatchError::RoutingUnavailable`]: crate::error::DispatchError::RoutingUnavailable
#[async_trait]
pub trait RoutingOracle: Send + Sync {
    async fn route(&self, from: Coordinate, to: Coordinate) -> Result<RouteEta>;

    /// Both legs, resolved concurrently.
    async fn full_route_eta(
        &self,
        driver: Coordinate,
        origin: Coordinate,
        destination: Coordinate,
    ) -> Result<FullRouteEta> {
        let (pickup, trip) =
            tokio::try_join!(self.route(driver, origin), self.route(origin, destination))?;
        Ok(FullRouteEta { pickup, trip })
    }
}

/// Great-circle distance at a constant average speed.
#[derive(Debug, Clone, Copy)]
pub struct HaversineRoutingOracle {
    speed_mps: f64,
}

impl HaversineRoutingOracle {
    pub fn new(average_speed_kmh: f64) -> Self {
        Self {
            speed_mps: average_speed_kmh / 3.6,
        }
    }

    fn estimate(&self, from: &Coordinate, to: &Coordinate) -> RouteEta {
        let distance_m = haversine_m(from, to);
        let duration_sec = if distance_m > 0.0 && self.speed_mps > 0.0 {
            distance_m / self.speed_mps
        } else {
            0.0
        };
        RouteEta::from_raw(duration_sec, distance_m)
    }
}

impl Default for HaversineRoutingOracle {
    fn default() -> Self {
        Self::new(RoutingConfig::default().average_speed_kmh)
    }
}

#[async_trait]
impl RoutingOracle for HaversineRoutingOracle {
    async fn route(&self, from: Coordinate, to: Coordinate) -> Result<RouteEta> {
        Ok(self.estimate(&from, &to))
    }
}

/// Directional cache key: coordinates quantized to 1e-5 degrees (about 1 m).
type LegKey = (i64, i64, i64, i64);

fn leg_key(from: &Coordinate, to: &Coordinate) -> LegKey {
    let q = |v: f64| (v * 1e5).round() as i64;
    (q(from.lat), q(from.lon), q(to.lat), q(to.lon))
}

/// LRU-cached wrapper around any [`RoutingOracle`]. Failures are not cached.
pub struct CachedRoutingOracle {
    inner: Arc<dyn RoutingOracle>,
    cache: Mutex<LruCache<LegKey, RouteEta>>,
}

impl CachedRoutingOracle {
    pub fn new(inner: Arc<dyn RoutingOracle>, capacity: NonZeroUsize) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }
}

#[async_trait]
impl RoutingOracle for CachedRoutingOracle {
    async fn route(&self, from: Coordinate, to: Coordinate) -> Result<RouteEta> {
        let key = leg_key(&from, &to);
        let hit = self.cache.lock().get(&key).copied();
        if let Some(eta) = hit {
            return Ok(eta);
        }

        let eta = self.inner.route(from, to).await?;
        self.cache.lock().put(key, eta);
        Ok(eta)
    }
}

/// Construct a shared [`RoutingOracle`] from configuration.
///
/// - `Haversine` is returned without caching.
/// - `Osrm` is wrapped in a [`CachedRoutingOracle`] unless `cache_capacity` is 0.
pub fn build_routing_oracle(config: &RoutingConfig) -> Result<Arc<dyn RoutingOracle>> {
    match &config.kind {
        RoutingOracleKind::Haversine => {
            Ok(Arc::new(HaversineRoutingOracle::new(config.average_speed_kmh)))
        }

        #[cfg(feature = "osrm")]
        RoutingOracleKind::Osrm { endpoint } => {
            let inner: Arc<dyn RoutingOracle> = Arc::new(osrm::OsrmRoutingOracle::new(
                endpoint,
                std::time::Duration::from_millis(config.request_timeout_ms),
            )?);
            Ok(with_cache(inner, config.cache_capacity))
        }

        #[cfg(not(feature = "osrm"))]
        RoutingOracleKind::Osrm { endpoint } => {
            warn!(
                endpoint = %endpoint,
                "osrm routing requested but the `osrm` feature is disabled; using haversine"
            );
            Ok(Arc::new(HaversineRoutingOracle::new(config.average_speed_kmh)))
        }
    }
}

#[cfg_attr(not(feature = "osrm"), allow(dead_code))]
fn with_cache(inner: Arc<dyn RoutingOracle>, capacity: usize) -> Arc<dyn RoutingOracle> {
    match NonZeroUsize::new(capacity) {
        Some(capacity) => Arc::new(CachedRoutingOracle::new(inner, capacity)),
        None => {
            warn!("route cache disabled");
            inner
        }
    }
}
