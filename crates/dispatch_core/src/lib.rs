pub mod config;
pub mod dispatch;
pub mod error;
pub mod geo;
pub mod ingest;
pub mod logging;
pub mod matching;
pub mod ports;
pub mod presence;
pub mod routing;
pub mod telemetry;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use error::{DispatchError, Result};
