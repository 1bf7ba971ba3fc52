//! OSRM HTTP routing oracle.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{RouteEta, RoutingOracle};
use crate::error::{DispatchError, Result};
use crate::geo::Coordinate;

/// Two points in Kigali used as a liveness probe.
const HEALTH_CHECK_FROM: Coordinate = Coordinate {
    lon: 30.0619,
    lat: -1.9444,
};
const HEALTH_CHECK_TO: Coordinate = Coordinate {
    lon: 30.0650,
    lat: -1.9500,
};

/// Routes via an OSRM HTTP endpoint.
pub struct OsrmRoutingOracle {
    client: Client,
    endpoint: String,
}

impl OsrmRoutingOracle {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| DispatchError::Config(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn route_url(&self, from: &Coordinate, to: &Coordinate) -> String {
        format!(
            "{}/route/v1/driving/{},{};{},{}?overview=false&alternatives=false&steps=false",
            self.endpoint, from.lon, from.lat, to.lon, to.lat,
        )
    }

    /// True when the service answers a known-good route.
    pub async fn health_check(&self) -> bool {
        match self.route(HEALTH_CHECK_FROM, HEALTH_CHECK_TO).await {
            Ok(_) => true,
            Err(err) => {
                warn!(endpoint = %self.endpoint, error = %err, "osrm health check failed");
                false
            }
        }
    }
}

/// Minimal OSRM JSON response structures.
#[derive(Deserialize)]
struct OsrmResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    routes: Option<Vec<OsrmRoute>>,
}

#[derive(Deserialize)]
struct OsrmRoute {
    distance: f64, // metres
    duration: f64, // seconds
}

fn parse_route(resp: OsrmResponse) -> Result<RouteEta> {
    if resp.code != "Ok" {
        return Err(DispatchError::RoutingUnavailable(format!(
            "osrm returned {}: {}",
            resp.code,
            resp.message.unwrap_or_default()
        )));
    }
    let route = resp
        .routes
        .and_then(|routes| routes.into_iter().next())
        .ok_or_else(|| DispatchError::RoutingUnavailable("osrm returned no route".into()))?;
    Ok(RouteEta::from_raw(route.duration, route.distance))
}

#[async_trait]
impl RoutingOracle for OsrmRoutingOracle {
    async fn route(&self, from: Coordinate, to: Coordinate) -> Result<RouteEta> {
        let url = self.route_url(&from, &to);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| DispatchError::RoutingUnavailable(format!("osrm request failed: {err}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(DispatchError::RoutingUnavailable(format!(
                "osrm responded with HTTP {status}"
            )));
        }

        let body: OsrmResponse = resp
            .json()
            .await
            .map_err(|err| DispatchError::RoutingUnavailable(format!("malformed osrm body: {err}")))?;
        let eta = parse_route(body)?;
        debug!(
            duration_sec = eta.duration_sec,
            distance_m = eta.distance_m,
            "osrm route"
        );
        Ok(eta)
    }
}
