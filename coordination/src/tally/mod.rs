//! Tally/Aggregation Engine
//!
//! Turns a closed round into an [`Outcome`]. Two variants share the same
//! contract shape and are pure functions of their input:
//!
//! - [`vote`]: weighted vote consensus for debates
//! - [`aggregate`]: multi-strategy aggregation of swarm role outputs
//!
//! Inputs are put in canonical order first so re-running a tally on the same
//! turns yields an identical outcome. Arrival order only enters through the
//! `recorded_at` stamp the collector puts on each turn.

pub mod aggregate;
pub mod vote;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::registry::ParticipantId;

pub use aggregate::{
    aggregate, validate_outcome, AggregationContext, AggregationStrategy, RoleOutput,
    SuccessCriteria, UnknownStrategyError, ValidationReport,
};
pub use vote::{tally_votes, tally_weighted, WeightedVote};

/// Error type for tally operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TallyError {
    #[error("No quorum: {counted} contribution(s) carried usable weight")]
    NoQuorum { counted: usize },

    #[error("Coordinator role '{0}' produced no output")]
    CoordinatorUnavailable(String),

    #[error("Hierarchical aggregation needs a coordinator role")]
    MissingCoordinatorRole,

    #[error("Summed weight of {counted} contribution(s) is not finite")]
    NonFiniteTotal { counted: usize },
}

/// A non-authoritative output attached to a hierarchical outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryOutput {
    pub participant_id: ParticipantId,
    pub role: String,
    pub data: serde_json::Value,
    pub confidence: f64,
}

/// Same key, different non-numeric values across outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConflict {
    pub key: String,
    /// Distinct values seen, in dispatch order.
    pub values: Vec<serde_json::Value>,
    /// Value kept in the merged result.
    pub chosen: serde_json::Value,
}

/// Final result of a session. Never mutated once computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// Winning option (votes, majority) or authoritative role/participant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<String>,
    /// Combined result for strategies that produce one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged: Option<serde_json::Value>,
    /// Option or contribution → weight.
    pub distribution: BTreeMap<String, f64>,
    /// Agreement score in [0, 1].
    pub consensus: f64,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub advisory: Vec<AdvisoryOutput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<MergeConflict>,
}

impl Outcome {
    /// Share of the distribution held by `key`.
    pub fn share(&self, key: &str) -> f64 {
        let total: f64 = self.distribution.values().sum();
        if total <= 0.0 {
            return 0.0;
        }
        self.distribution.get(key).copied().unwrap_or(0.0) / total
    }
}

/// Normalised comparison key for a result: trimmed lowercase text for
/// strings, canonical JSON for everything else.
pub fn normalize(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.trim().to_lowercase(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(&json!("  Approve ")), "approve");
        assert_eq!(normalize(&json!({"b": 1, "a": 2})), normalize(&json!({"a": 2, "b": 1})));
        assert_eq!(normalize(&json!(3)), "3");
    }

    #[test]
    fn test_share() {
        let outcome = Outcome {
            winner: Some("A".to_string()),
            merged: None,
            distribution: BTreeMap::from([("A".to_string(), 3.0), ("B".to_string(), 1.0)]),
            consensus: 0.75,
            summary: String::new(),
            advisory: vec![],
            conflicts: vec![],
        };
        assert!((outcome.share("A") - 0.75).abs() < 1e-12);
        assert_eq!(outcome.share("C"), 0.0);
    }
}
