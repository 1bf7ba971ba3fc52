//! Location ingest: validates, throttles and commits driver position updates.
//!
//! Throttling only applies to drivers that are already discoverable. A driver
//! who dropped out of the proximity index (disconnect, offline toggle) is always
//! re-indexed on the next update, however little they moved.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::IngestConfig;
use crate::error::Result;
use crate::geo::{haversine_m, Coordinate};
use crate::presence::{LastKnownPosition, NearbyDriver, PresenceStore};
use crate::telemetry::DispatchTelemetry;

/// A position report from a driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub driver_id: String,
    pub lat: f64,
    pub lon: f64,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Throttled,
    InvalidCoordinates,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdateResult {
    pub updated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_moved_m: Option<f64>,
}

impl LocationUpdateResult {
    fn updated() -> Self {
        Self {
            updated: true,
            reason: None,
            distance_moved_m: None,
        }
    }

    fn skipped(reason: SkipReason, distance_moved_m: Option<f64>) -> Self {
        Self {
            updated: false,
            reason: Some(reason),
            distance_moved_m,
        }
    }
}

/// Operational status a driver can toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverAvailability {
    Online,
    /// Engaged on a trip: stays present and indexed, excluded by eligibility.
    Busy,
    Offline,
}

/// Read model combining the presence flag with the last known position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverPresence {
    pub online: bool,
    pub indexed_position: Option<Coordinate>,
    pub last_known: Option<LastKnownPosition>,
}

pub struct LocationIngest {
    store: Arc<dyn PresenceStore>,
    config: IngestConfig,
    telemetry: Arc<DispatchTelemetry>,
}

impl LocationIngest {
    pub fn new(store: Arc<dyn PresenceStore>, config: IngestConfig) -> Self {
        Self::with_telemetry(store, config, Arc::new(DispatchTelemetry::default()))
    }

    pub fn with_telemetry(
        store: Arc<dyn PresenceStore>,
        config: IngestConfig,
        telemetry: Arc<DispatchTelemetry>,
    ) -> Self {
        Self {
            store,
            config,
            telemetry,
        }
    }

    pub fn store(&self) -> &Arc<dyn PresenceStore> {
        &self.store
    }

    /// Apply a position report, throttled by displacement.
    ///
    /// Invalid coordinates are reported in the result, not as an error; store
    /// failures are propagated.
    pub async fn update_location(&self, update: &LocationUpdate) -> Result<LocationUpdateResult> {
        let point = Coordinate {
            lat: update.lat,
            lon: update.lon,
        };
        if !point.is_valid() {
            warn!(
                driver_id = %update.driver_id,
                lat = update.lat,
                lon = update.lon,
                "invalid coordinates in location update"
            );
            self.telemetry.record_location_rejected();
            return Ok(LocationUpdateResult::skipped(
                SkipReason::InvalidCoordinates,
                None,
            ));
        }

        let is_indexed = self.store.get_position(&update.driver_id).await?.is_some();
        let last_known = self.store.get_last_known_position(&update.driver_id).await?;

        if let (Some(last), true) = (last_known, is_indexed) {
            let moved_m = haversine_m(&last.coordinate, &point);
            if moved_m < self.config.min_distance_threshold_m {
                self.store.touch(&update.driver_id).await?;
                debug!(
                    driver_id = %update.driver_id,
                    moved_m,
                    "throttled location update"
                );
                self.telemetry.record_location_throttled();
                return Ok(LocationUpdateResult::skipped(
                    SkipReason::Throttled,
                    Some(moved_m),
                ));
            }
        }

        self.commit(update).await?;
        Ok(LocationUpdateResult::updated())
    }

    /// Commit a position unconditionally (first fix, accuracy-critical paths).
    pub async fn force_update_location(&self, update: &LocationUpdate) -> Result<()> {
        let point = Coordinate {
            lat: update.lat,
            lon: update.lon,
        };
        if let Err(err) = point.validate() {
            warn!(driver_id = %update.driver_id, "invalid coordinates in forced update");
            self.telemetry.record_location_rejected();
            return Err(err);
        }
        self.commit(update).await
    }

    async fn commit(&self, update: &LocationUpdate) -> Result<()> {
        self.store
            .batch_commit(&update.driver_id, update.lon, update.lat, update.timestamp_ms)
            .await?;
        self.telemetry.record_location_applied();
        Ok(())
    }

    /// Indexed drivers near a point whose online flag is still set.
    ///
    /// The presence re-check closes the window between a driver going offline
    /// and its index entry being removed.
    pub async fn get_nearby_drivers(
        &self,
        lat: f64,
        lon: f64,
        radius_m: f64,
        limit: usize,
    ) -> Result<Vec<NearbyDriver>> {
        let origin = Coordinate { lat, lon };
        let candidates = self.store.search_nearby(origin, radius_m, limit).await?;
        let mut online = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if self.store.is_online(&candidate.driver_id).await? {
                online.push(candidate);
            }
        }
        Ok(online)
    }

    pub async fn get_driver_position(&self, driver_id: &str) -> Result<Option<Coordinate>> {
        self.store.get_position(driver_id).await
    }

    pub async fn get_driver_presence(&self, driver_id: &str) -> Result<DriverPresence> {
        Ok(DriverPresence {
            online: self.store.is_online(driver_id).await?,
            indexed_position: self.store.get_position(driver_id).await?,
            last_known: self.store.get_last_known_position(driver_id).await?,
        })
    }

    /// Forget everything about a driver's location (used on disconnect).
    pub async fn remove_driver_location(&self, driver_id: &str) -> Result<()> {
        self.store.remove_driver(driver_id).await?;
        self.store.set_offline(driver_id).await?;
        self.store.clear_last_known_position(driver_id).await?;
        debug!(driver_id, "removed driver location");
        Ok(())
    }

    /// Reflect a driver's status toggle in the presence store.
    pub async fn set_driver_availability(
        &self,
        driver_id: &str,
        availability: DriverAvailability,
    ) -> Result<()> {
        match availability {
            DriverAvailability::Online => self.store.set_online(driver_id).await,
            DriverAvailability::Offline => {
                self.store.set_offline(driver_id).await?;
                self.store.remove_driver(driver_id).await
            }
            DriverAvailability::Busy => Ok(()),
        }
    }
}
