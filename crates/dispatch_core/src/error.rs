//! Error types for the dispatch engine.

use thiserror::Error;

/// Dispatch engine errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// Latitude outside [-90, 90] or longitude outside [-180, 180].
    #[error("invalid coordinate: lat={lat}, lon={lon}")]
    InvalidCoordinate { lat: f64, lon: f64 },

    /// The routing oracle is down or did not answer within its bound.
    #[error("routing service unavailable: {0}")]
    RoutingUnavailable(String),

    /// A single route could not be computed. Not fatal for a matching pass.
    #[error("route failed: {0}")]
    RouteFailed(String),

    /// The driver-eligibility source failed.
    #[error("eligibility lookup failed: {0}")]
    Eligibility(String),

    /// The ride repository failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Someone other than the owning rider tried to act on a request.
    #[error("caller {caller_id} does not own request {request_id}")]
    NotRequestOwner {
        request_id: String,
        caller_id: String,
    },

    #[error("request {0} is already being dispatched")]
    RequestAlreadyPending(String),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
}

impl DispatchError {
    /// True for routing failures that must abort a whole matching pass.
    pub fn is_routing_outage(&self) -> bool {
        matches!(self, DispatchError::RoutingUnavailable(_))
    }
}

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;
