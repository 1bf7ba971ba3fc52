//! Geospatial presence: where each driver is and whether they are online.
//!
//! This module provides:
//!
//! - **PresenceStore**: async contract over the proximity index, the TTL-backed
//!   online flag and the last-known-position record
//! - **ProximityIndex**: H3 cell → driver buckets for radius-bounded
//!   nearest-neighbour queries, refined by exact Haversine distance
//! - **InMemoryPresenceStore**: the bundled store; a single lock makes
//!   `batch_commit` atomic for readers
//!
//! Index entries never expire on their own. A driver leaves the index only
//! through [`PresenceStore::remove_driver`]; callers that need "online and
//! indexed" must also consult the online flag.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use h3o::{CellIndex, Resolution};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::PresenceConfig;
use crate::error::Result;
use crate::geo::Coordinate;

pub type DriverId = String;

/// One proximity hit, ordered by `distance_m` in query results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyDriver {
    pub driver_id: DriverId,
    pub distance_m: f64,
    pub coordinate: Coordinate,
}

/// Last committed position, kept longer than the online flag.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LastKnownPosition {
    pub coordinate: Coordinate,
    pub timestamp_ms: i64,
}

#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Insert or move a driver in the proximity index.
    async fn upsert_position(&self, driver_id: &str, lon: f64, lat: f64) -> Result<()>;

    /// Drop a driver from the index and clear the online flag. Idempotent.
    async fn remove_driver(&self, driver_id: &str) -> Result<()>;

    /// Set (or refresh) the online flag. Does not touch the index.
    async fn set_online(&self, driver_id: &str) -> Result<()>;

    async fn set_offline(&self, driver_id: &str) -> Result<()>;

    async fn is_online(&self, driver_id: &str) -> Result<bool>;

    /// Position as held by the proximity index; `None` means "not indexed".
    async fn get_position(&self, driver_id: &str) -> Result<Option<Coordinate>>;

    async fn get_last_known_position(&self, driver_id: &str) -> Result<Option<LastKnownPosition>>;

    async fn clear_last_known_position(&self, driver_id: &str) -> Result<()>;

    /// Indexed drivers within `radius_m` of `origin`, nearest first.
    async fn search_nearby(
        &self,
        origin: Coordinate,
        radius_m: f64,
        limit: usize,
    ) -> Result<Vec<NearbyDriver>>;

    /// Upsert position, set online and record the last position as one unit.
    async fn batch_commit(&self, driver_id: &str, lon: f64, lat: f64, timestamp_ms: i64)
        -> Result<()>;

    /// Refresh the online TTL without moving the driver.
    async fn touch(&self, driver_id: &str) -> Result<()> {
        self.set_online(driver_id).await
    }
}

#[derive(Debug, Clone, Copy)]
struct IndexedDriver {
    coordinate: Coordinate,
    cell: CellIndex,
}

/// Proximity index for driver lookups by H3 cell.
///
/// Maintains cell → drivers buckets plus the reverse mapping so moves are
/// O(bucket) instead of a scan over every driver.
#[derive(Debug)]
pub struct ProximityIndex {
    resolution: Resolution,
    drivers_by_cell: HashMap<CellIndex, Vec<DriverId>>,
    entries: HashMap<DriverId, IndexedDriver>,
}

impl Default for ProximityIndex {
    fn default() -> Self {
        Self::new(Resolution::Seven)
    }
}

impl ProximityIndex {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            drivers_by_cell: HashMap::new(),
            entries: HashMap::new(),
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn position(&self, driver_id: &str) -> Option<Coordinate> {
        self.entries.get(driver_id).map(|e| e.coordinate)
    }

    /// Insert or move a driver. The coordinate must already be validated.
    pub fn upsert(&mut self, driver_id: &str, coordinate: Coordinate) {
        let Some(new_cell) = coordinate.to_cell(self.resolution) else {
            return;
        };
        if let Some(existing) = self.entries.get_mut(driver_id) {
            let old_cell = existing.cell;
            existing.coordinate = coordinate;
            existing.cell = new_cell;
            if old_cell == new_cell {
                return;
            }
            self.detach(driver_id, old_cell);
        } else {
            self.entries.insert(
                driver_id.to_string(),
                IndexedDriver {
                    coordinate,
                    cell: new_cell,
                },
            );
        }
        self.drivers_by_cell
            .entry(new_cell)
            .or_default()
            .push(driver_id.to_string());
    }

    /// Remove a driver; returns whether it was present.
    pub fn remove(&mut self, driver_id: &str) -> bool {
        match self.entries.remove(driver_id) {
            Some(entry) => {
                self.detach(driver_id, entry.cell);
                true
            }
            None => false,
        }
    }

    fn detach(&mut self, driver_id: &str, cell: CellIndex) {
        if let Some(ids) = self.drivers_by_cell.get_mut(&cell) {
            ids.retain(|id| id != driver_id);
            if ids.is_empty() {
                self.drivers_by_cell.remove(&cell);
            }
        }
    }

    /// Drivers within `radius_m` of `origin`, nearest first (driver id breaks
    /// ties), at most `limit` entries.
    pub fn search(&self, origin: Coordinate, radius_m: f64, limit: usize) -> Vec<NearbyDriver> {
        if limit == 0 || self.entries.is_empty() || !(radius_m >= 0.0) {
            return Vec::new();
        }
        let Some(origin_cell) = origin.to_cell(self.resolution) else {
            return Vec::new();
        };

        let k = self.disk_radius_for(radius_m);
        let mut hits: Vec<NearbyDriver> = if h3o::max_grid_disk_size(k) >= self.entries.len() as u64 {
            // The disk would visit more cells than there are drivers.
            self.entries
                .iter()
                .filter_map(|(id, entry)| within(id, entry, &origin, radius_m))
                .collect()
        } else {
            origin_cell
                .grid_disk::<Vec<_>>(k)
                .into_iter()
                .filter_map(|cell| self.drivers_by_cell.get(&cell))
                .flatten()
                .filter_map(|id| {
                    self.entries
                        .get(id)
                        .and_then(|entry| within(id, entry, &origin, radius_m))
                })
                .collect()
        };

        hits.sort_by(|a, b| {
            a.distance_m
                .total_cmp(&b.distance_m)
                .then_with(|| a.driver_id.cmp(&b.driver_id))
        });
        hits.truncate(limit);
        hits
    }

    /// Grid-disk radius guaranteed to cover a circle of `radius_m`.
    fn disk_radius_for(&self, radius_m: f64) -> u32 {
        let edge_m = self.resolution.edge_length_m();
        let rings = (radius_m / edge_m).ceil();
        if rings >= f64::from(u16::MAX) {
            u32::from(u16::MAX)
        } else {
            rings as u32 + 1
        }
    }
}

fn within(
    id: &str,
    entry: &IndexedDriver,
    origin: &Coordinate,
    radius_m: f64,
) -> Option<NearbyDriver> {
    let distance_m = origin.distance_m(&entry.coordinate);
    (distance_m <= radius_m).then(|| NearbyDriver {
        driver_id: id.to_string(),
        distance_m,
        coordinate: entry.coordinate,
    })
}

#[derive(Debug, Default)]
struct PresenceState {
    index: ProximityIndex,
    online_until: HashMap<DriverId, Instant>,
    last_positions: HashMap<DriverId, (LastKnownPosition, Instant)>,
}

/// In-process presence store.
///
/// One `RwLock` guards the index and both TTL tables, so a `batch_commit` is
/// never observed half-applied. The lock is never held across an `.await`.
#[derive(Debug)]
pub struct InMemoryPresenceStore {
    state: RwLock<PresenceState>,
    presence_ttl: Duration,
    last_position_ttl: Duration,
}

impl Default for InMemoryPresenceStore {
    fn default() -> Self {
        let config = PresenceConfig::default();
        Self {
            state: RwLock::new(PresenceState::default()),
            presence_ttl: config.presence_ttl(),
            last_position_ttl: config.last_position_ttl(),
        }
    }
}

impl InMemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: &PresenceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: RwLock::new(PresenceState {
                index: ProximityIndex::new(config.resolution()?),
                ..Default::default()
            }),
            presence_ttl: config.presence_ttl(),
            last_position_ttl: config.last_position_ttl(),
        })
    }

    /// Number of drivers currently in the proximity index.
    pub fn indexed_count(&self) -> usize {
        self.state.read().index.len()
    }
}

#[async_trait]
impl PresenceStore for InMemoryPresenceStore {
    async fn upsert_position(&self, driver_id: &str, lon: f64, lat: f64) -> Result<()> {
        let coordinate = Coordinate::new(lat, lon)?;
        self.state.write().index.upsert(driver_id, coordinate);
        Ok(())
    }

    async fn remove_driver(&self, driver_id: &str) -> Result<()> {
        let mut state = self.state.write();
        state.index.remove(driver_id);
        state.online_until.remove(driver_id);
        Ok(())
    }

    async fn set_online(&self, driver_id: &str) -> Result<()> {
        let expires = Instant::now() + self.presence_ttl;
        self.state
            .write()
            .online_until
            .insert(driver_id.to_string(), expires);
        Ok(())
    }

    async fn set_offline(&self, driver_id: &str) -> Result<()> {
        self.state.write().online_until.remove(driver_id);
        Ok(())
    }

    async fn is_online(&self, driver_id: &str) -> Result<bool> {
        let now = Instant::now();
        let expired = {
            let state = self.state.read();
            match state.online_until.get(driver_id) {
                Some(expires) if *expires > now => return Ok(true),
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            let mut state = self.state.write();
            if state
                .online_until
                .get(driver_id)
                .is_some_and(|expires| *expires <= now)
            {
                state.online_until.remove(driver_id);
            }
        }
        Ok(false)
    }

    async fn get_position(&self, driver_id: &str) -> Result<Option<Coordinate>> {
        Ok(self.state.read().index.position(driver_id))
    }

    async fn get_last_known_position(&self, driver_id: &str) -> Result<Option<LastKnownPosition>> {
        let now = Instant::now();
        Ok(self
            .state
            .read()
            .last_positions
            .get(driver_id)
            .filter(|(_, expires)| *expires > now)
            .map(|(position, _)| *position))
    }

    async fn clear_last_known_position(&self, driver_id: &str) -> Result<()> {
        self.state.write().last_positions.remove(driver_id);
        Ok(())
    }

    async fn search_nearby(
        &self,
        origin: Coordinate,
        radius_m: f64,
        limit: usize,
    ) -> Result<Vec<NearbyDriver>> {
        origin.validate()?;
        Ok(self.state.read().index.search(origin, radius_m, limit))
    }

    async fn batch_commit(
        &self,
        driver_id: &str,
        lon: f64,
        lat: f64,
        timestamp_ms: i64,
    ) -> Result<()> {
        let coordinate = Coordinate::new(lat, lon)?;
        let now = Instant::now();
        let mut state = self.state.write();
        state.index.upsert(driver_id, coordinate);
        state
            .online_until
            .insert(driver_id.to_string(), now + self.presence_ttl);
        state.last_positions.insert(
            driver_id.to_string(),
            (
                LastKnownPosition {
                    coordinate,
                    timestamp_ms,
                },
                now + self.last_position_ttl,
            ),
        );
        Ok(())
    }
}
