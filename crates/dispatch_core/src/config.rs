//! Runtime configuration.
//!
//! Every section has a `Default` matching the reference deployment; a JSON
//! document may override any subset, and a handful of environment variables
//! override the result (see [`DispatchConfig::with_env_overrides`]).

use std::time::Duration;

use h3o::Resolution;
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

/// Upper bound on the presence TTL; keeps `Instant + ttl` arithmetic in range.
pub const MAX_PRESENCE_TTL_SECS: u64 = 86_400;
/// Upper bound on the last-position TTL multiplier.
pub const MAX_LAST_POSITION_TTL_FACTOR: u32 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// TTL of the online flag (seconds).
    pub presence_ttl_secs: u64,
    /// Last-position TTL as a multiple of the presence TTL.
    pub last_position_ttl_factor: u32,
    /// H3 resolution used to bucket the proximity index (0-15).
    pub index_resolution: u8,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            presence_ttl_secs: 120,
            last_position_ttl_factor: 2,
            index_resolution: 7,
        }
    }
}

impl PresenceConfig {
    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_secs)
    }

    pub fn last_position_ttl(&self) -> Duration {
        self.presence_ttl()
            .saturating_mul(self.last_position_ttl_factor)
    }

    pub fn validate(&self) -> Result<()> {
        if self.presence_ttl_secs == 0 || self.last_position_ttl_factor == 0 {
            return Err(DispatchError::Config("presence TTLs must be positive".into()));
        }
        if self.presence_ttl_secs > MAX_PRESENCE_TTL_SECS
            || self.last_position_ttl_factor > MAX_LAST_POSITION_TTL_FACTOR
        {
            return Err(DispatchError::Config(format!(
                "presence TTL {}s x{} exceeds the {MAX_PRESENCE_TTL_SECS}s x{MAX_LAST_POSITION_TTL_FACTOR} limit",
                self.presence_ttl_secs, self.last_position_ttl_factor
            )));
        }
        self.resolution()?;
        Ok(())
    }

    pub fn resolution(&self) -> Result<Resolution> {
        Resolution::try_from(self.index_resolution).map_err(|err| {
            DispatchError::Config(format!(
                "invalid index resolution {}: {err}",
                self.index_resolution
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Minimum displacement before an indexed driver's position is rewritten.
    pub min_distance_threshold_m: f64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            min_distance_threshold_m: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub default_radius_m: f64,
    /// Upper bound for the single radius expansion.
    pub max_radius_m: f64,
    pub default_max_candidates: usize,
    /// Proximity over-fetch multiplier applied before eligibility filtering.
    pub overfetch_factor: usize,
    pub pickup_weight: f64,
    pub trip_weight: f64,
    /// Upper bound on a single routing-oracle call.
    pub routing_timeout_ms: u64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            default_radius_m: 5_000.0,
            max_radius_m: 15_000.0,
            default_max_candidates: 5,
            overfetch_factor: 2,
            pickup_weight: 0.7,
            trip_weight: 0.3,
            routing_timeout_ms: 5_000,
        }
    }
}

impl MatchingConfig {
    pub fn routing_timeout(&self) -> Duration {
        Duration::from_millis(self.routing_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchTimingConfig {
    /// How long a driver has to answer an offer.
    pub offer_timeout_ms: u64,
}

impl Default for DispatchTimingConfig {
    fn default() -> Self {
        Self {
            offer_timeout_ms: 30_000,
        }
    }
}

impl DispatchTimingConfig {
    pub fn offer_timeout(&self) -> Duration {
        Duration::from_millis(self.offer_timeout_ms)
    }
}

/// Which routing backend to use.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoutingOracleKind {
    /// Straight-line distance at a fixed average speed. No external service.
    #[default]
    Haversine,
    /// OSRM HTTP endpoint (e.g. `"http://localhost:5000"`).
    Osrm { endpoint: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub kind: RoutingOracleKind,
    /// Speed assumed by the Haversine oracle.
    pub average_speed_kmh: f64,
    /// LRU capacity for the route cache; 0 disables caching.
    pub cache_capacity: usize,
    /// HTTP timeout for remote oracles.
    pub request_timeout_ms: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            kind: RoutingOracleKind::Haversine,
            average_speed_kmh: 30.0,
            cache_capacity: 20_000,
            request_timeout_ms: 3_000,
        }
    }
}

/// Top-level configuration for the dispatch engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub presence: PresenceConfig,
    pub ingest: IngestConfig,
    pub matching: MatchingConfig,
    pub timing: DispatchTimingConfig,
    pub routing: RoutingConfig,
}

impl DispatchConfig {
    /// Parse a (possibly partial) JSON document; missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| DispatchError::Config(format!("malformed config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (used by tests).
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&lookup, "LOCATION_MIN_DISTANCE_M")? {
            self.ingest.min_distance_threshold_m = v;
        }
        if let Some(v) = parse_var(&lookup, "PRESENCE_TTL_SEC")? {
            self.presence.presence_ttl_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "OFFER_TIMEOUT_MS")? {
            self.timing.offer_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "MATCH_RADIUS_M")? {
            self.matching.default_radius_m = v;
        }
        if let Some(v) = parse_var(&lookup, "MATCH_MAX_RADIUS_M")? {
            self.matching.max_radius_m = v;
        }
        if let Some(endpoint) = lookup("OSRM_URL").filter(|v| !v.trim().is_empty()) {
            self.routing.kind = RoutingOracleKind::Osrm { endpoint };
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        self.presence.validate()?;
        if !(self.ingest.min_distance_threshold_m > 0.0) {
            return Err(DispatchError::Config(
                "min_distance_threshold_m must be positive".into(),
            ));
        }
        let m = &self.matching;
        if !(m.default_radius_m > 0.0) || m.max_radius_m < m.default_radius_m {
            return Err(DispatchError::Config(format!(
                "invalid radii: default={} max={}",
                m.default_radius_m, m.max_radius_m
            )));
        }
        if m.default_max_candidates == 0 || m.overfetch_factor == 0 {
            return Err(DispatchError::Config(
                "candidate limits must be positive".into(),
            ));
        }
        for (name, weight) in [("pickup_weight", m.pickup_weight), ("trip_weight", m.trip_weight)] {
            if !(0.0..=1.0).contains(&weight) {
                return Err(DispatchError::Config(format!(
                    "{name} must be within [0, 1], got {weight}"
                )));
            }
        }
        if self.timing.offer_timeout_ms == 0 || m.routing_timeout_ms == 0 {
            return Err(DispatchError::Config("timeouts must be positive".into()));
        }
        if !(self.routing.average_speed_kmh > 0.0) {
            return Err(DispatchError::Config(
                "average_speed_kmh must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| DispatchError::Config(format!("{key}: cannot parse {raw:?}"))),
    }
}
