pub mod engine;
pub mod scoring;
pub mod types;

pub use engine::MatchingEngine;
pub use scoring::EtaWeightedScoring;
pub use types::{MatchCandidate, MatchRequest, MatchResult};
