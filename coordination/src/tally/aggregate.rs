//! Multi-strategy aggregation of swarm role outputs.
//!
//! Strategies are dispatched through a static table keyed by tag, so adding a
//! strategy is one table row plus one function.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::vote::{tally_weighted, WeightedVote};
use super::{normalize, AdvisoryOutput, MergeConflict, Outcome, TallyError};
use crate::registry::ParticipantId;

/// Aggregation strategy tag of an assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AggregationStrategy {
    Majority,
    WeightedMerge,
    BestOf,
    Concatenation,
    Voting,
    Hierarchical,
}

/// Unknown strategy tag in an assembly definition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown aggregation strategy: {0}")]
pub struct UnknownStrategyError(pub String);

type AggregateFn = fn(&[RoleOutput], &AggregationContext) -> Result<Outcome, TallyError>;

const STRATEGIES: &[(&str, AggregationStrategy, AggregateFn)] = &[
    ("majority", AggregationStrategy::Majority, majority),
    ("weighted-merge", AggregationStrategy::WeightedMerge, weighted_merge),
    ("best-of", AggregationStrategy::BestOf, best_of),
    ("concatenation", AggregationStrategy::Concatenation, concatenation),
    ("voting", AggregationStrategy::Voting, voting),
    ("hierarchical", AggregationStrategy::Hierarchical, hierarchical),
];

impl AggregationStrategy {
    pub fn tag(self) -> &'static str {
        STRATEGIES
            .iter()
            .find(|(_, s, _)| *s == self)
            .map(|(tag, _, _)| *tag)
            .unwrap_or("unknown")
    }

    fn handler(self) -> Option<AggregateFn> {
        STRATEGIES
            .iter()
            .find(|(_, s, _)| *s == self)
            .map(|(_, _, f)| *f)
    }
}

impl FromStr for AggregationStrategy {
    type Err = UnknownStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_lowercase().replace('_', "-");
        STRATEGIES
            .iter()
            .find(|(t, _, _)| *t == tag)
            .map(|(_, s, _)| *s)
            .ok_or_else(|| UnknownStrategyError(s.to_string()))
    }
}

impl std::fmt::Display for AggregationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// One completed role output, in dispatch order.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleOutput {
    pub participant_id: ParticipantId,
    pub role: String,
    pub data: Value,
    pub confidence: f64,
    /// Participant tally weight.
    pub weight: f64,
    /// When the collector accepted the output.
    pub recorded_at: DateTime<Utc>,
}

/// Assembly-level inputs an aggregation may need.
#[derive(Debug, Clone, Default)]
pub struct AggregationContext {
    /// Roles dispatched, including ones that produced nothing.
    pub expected: usize,
    pub coordinator_role: Option<String>,
}

/// Aggregate role outputs with the given strategy.
pub fn aggregate(
    strategy: AggregationStrategy,
    outputs: &[RoleOutput],
    context: &AggregationContext,
) -> Result<Outcome, TallyError> {
    if outputs.is_empty() {
        return Err(TallyError::NoQuorum { counted: 0 });
    }
    let handler = strategy
        .handler()
        .ok_or(TallyError::NoQuorum { counted: 0 })?;
    debug!(strategy = %strategy, outputs = outputs.len(), "Aggregating role outputs");
    handler(outputs, context)
}

fn clamp_confidence(c: f64) -> f64 {
    if c.is_finite() {
        c.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Most common normalised result wins; ties go to the group dispatched first.
fn majority(outputs: &[RoleOutput], _ctx: &AggregationContext) -> Result<Outcome, TallyError> {
    // key -> (count, first index)
    let mut groups: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    for (idx, output) in outputs.iter().enumerate() {
        let entry = groups.entry(normalize(&output.data)).or_insert((0, idx));
        entry.0 += 1;
    }

    let (key, (count, first)) = groups
        .iter()
        .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then_with(|| b.1 .1.cmp(&a.1 .1)))
        .map(|(k, v)| (k.clone(), *v))
        .ok_or(TallyError::NoQuorum { counted: 0 })?;

    let consensus = count as f64 / outputs.len() as f64;
    Ok(Outcome {
        winner: Some(key.clone()),
        merged: Some(outputs[first].data.clone()),
        distribution: groups
            .iter()
            .map(|(k, (n, _))| (k.clone(), *n as f64))
            .collect(),
        consensus,
        summary: format!(
            "majority result shared by {} of {} outputs",
            count,
            outputs.len()
        ),
        advisory: Vec::new(),
        conflicts: Vec::new(),
    })
}

/// Weighted average for numbers, heaviest value for everything else.
///
/// Non-object outputs are merged as if they were `{"value": data}` and
/// unwrapped again at the end.
fn weighted_merge(outputs: &[RoleOutput], _ctx: &AggregationContext) -> Result<Outcome, TallyError> {
    let weights: Vec<f64> = outputs
        .iter()
        .map(|o| clamp_confidence(o.confidence) * o.weight.max(0.0))
        .collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return Err(TallyError::NoQuorum { counted: 0 });
    }

    let all_objects = outputs.iter().all(|o| o.data.is_object());
    let as_object = |data: &Value| -> Map<String, Value> {
        match data {
            Value::Object(map) => map.clone(),
            other => Map::from_iter([("value".to_string(), other.clone())]),
        }
    };

    // key -> contributions (value, weight) in dispatch order
    let mut keys: Vec<String> = Vec::new();
    let mut contributions: HashMap<String, Vec<(Value, f64)>> = HashMap::new();
    for (output, weight) in outputs.iter().zip(&weights) {
        for (key, value) in as_object(&output.data) {
            if !contributions.contains_key(&key) {
                keys.push(key.clone());
            }
            contributions.entry(key).or_default().push((value, *weight));
        }
    }

    let mut merged = Map::new();
    let mut conflicts = Vec::new();
    let mut agreement = 0.0;
    for key in &keys {
        let Some(values) = contributions.get(key) else {
            continue;
        };
        let key_weight: f64 = values.iter().map(|(_, w)| w).sum();

        if values.iter().all(|(v, _)| v.is_number()) && key_weight > 0.0 {
            let sum: f64 = values
                .iter()
                .filter_map(|(v, w)| v.as_f64().map(|n| n * w))
                .sum();
            let avg = sum / key_weight;
            merged.insert(
                key.clone(),
                serde_json::Number::from_f64(avg).map_or(Value::Null, Value::Number),
            );
            agreement += 1.0;
            continue;
        }

        // distinct normalised value -> (first value, summed weight), dispatch order
        let mut distinct: Vec<(String, Value, f64)> = Vec::new();
        for (value, weight) in values {
            let norm = normalize(value);
            match distinct.iter_mut().find(|(n, _, _)| *n == norm) {
                Some(entry) => entry.2 += weight,
                None => distinct.push((norm, value.clone(), *weight)),
            }
        }
        let mut chosen = &distinct[0];
        for candidate in &distinct[1..] {
            if candidate.2 > chosen.2 {
                chosen = candidate;
            }
        }
        if distinct.len() > 1 {
            conflicts.push(MergeConflict {
                key: key.clone(),
                values: distinct.iter().map(|(_, v, _)| v.clone()).collect(),
                chosen: chosen.1.clone(),
            });
        }
        agreement += if key_weight > 0.0 { chosen.2 / key_weight } else { 0.0 };
        merged.insert(key.clone(), chosen.1.clone());
    }

    let consensus = if keys.is_empty() {
        1.0
    } else {
        agreement / keys.len() as f64
    };
    let merged = if all_objects {
        Value::Object(merged)
    } else {
        merged.remove("value").unwrap_or(Value::Object(merged))
    };

    Ok(Outcome {
        winner: None,
        merged: Some(merged),
        distribution: outputs
            .iter()
            .zip(&weights)
            .map(|(o, w)| (o.participant_id.clone(), w / total))
            .collect(),
        consensus: consensus.clamp(0.0, 1.0),
        summary: format!(
            "merged {} outputs across {} key(s), {} conflict(s)",
            outputs.len(),
            keys.len(),
            conflicts.len()
        ),
        advisory: Vec::new(),
        conflicts,
    })
}

/// Single output with the highest self-reported confidence, returned verbatim.
fn best_of(outputs: &[RoleOutput], _ctx: &AggregationContext) -> Result<Outcome, TallyError> {
    let mut best = &outputs[0];
    for output in &outputs[1..] {
        if clamp_confidence(output.confidence) > clamp_confidence(best.confidence) {
            best = output;
        }
    }

    Ok(Outcome {
        winner: Some(best.role.clone()),
        merged: Some(best.data.clone()),
        distribution: outputs
            .iter()
            .map(|o| (o.role.clone(), clamp_confidence(o.confidence)))
            .collect(),
        consensus: clamp_confidence(best.confidence),
        summary: format!(
            "best of {} outputs: role '{}' at confidence {:.2}",
            outputs.len(),
            best.role,
            best.confidence
        ),
        advisory: Vec::new(),
        conflicts: Vec::new(),
    })
}

/// Order-preserving union of distinct outputs. No winner.
fn concatenation(outputs: &[RoleOutput], ctx: &AggregationContext) -> Result<Outcome, TallyError> {
    let mut seen = Vec::new();
    let mut items = Vec::new();
    for output in outputs {
        let norm = normalize(&output.data);
        if !seen.contains(&norm) {
            seen.push(norm);
            items.push(output.data.clone());
        }
    }

    let expected = ctx.expected.max(outputs.len());
    Ok(Outcome {
        winner: None,
        merged: Some(Value::Array(items)),
        distribution: outputs.iter().map(|o| (o.role.clone(), 1.0)).collect(),
        consensus: outputs.len() as f64 / expected as f64,
        summary: format!(
            "concatenated {} distinct of {} outputs",
            seen.len(),
            outputs.len()
        ),
        advisory: Vec::new(),
        conflicts: Vec::new(),
    })
}

/// Each output votes for its `option` field (or its normalised value),
/// weighted by confidence × participant weight.
fn voting(outputs: &[RoleOutput], _ctx: &AggregationContext) -> Result<Outcome, TallyError> {
    let option_of = |data: &Value| -> String {
        data.get("option")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| normalize(data))
    };

    let votes = outputs
        .iter()
        .map(|o| WeightedVote {
            voter: o.participant_id.clone(),
            option: option_of(&o.data),
            weight: clamp_confidence(o.confidence) * o.weight,
            recorded_at: o.recorded_at,
        })
        .collect();
    let mut outcome = tally_weighted(votes)?;
    outcome.merged = outcome.winner.as_ref().and_then(|winner| {
        outputs
            .iter()
            .find(|o| option_of(&o.data) == *winner)
            .map(|o| o.data.clone())
    });
    Ok(outcome)
}

/// The coordinator role's output is authoritative; others ride along as advisory.
fn hierarchical(outputs: &[RoleOutput], ctx: &AggregationContext) -> Result<Outcome, TallyError> {
    let role = ctx
        .coordinator_role
        .as_deref()
        .ok_or(TallyError::MissingCoordinatorRole)?;
    let coordinator = outputs
        .iter()
        .find(|o| o.role == role)
        .ok_or_else(|| TallyError::CoordinatorUnavailable(role.to_string()))?;

    let decision = normalize(&coordinator.data);
    let advisory: Vec<AdvisoryOutput> = outputs
        .iter()
        .filter(|o| o.role != role)
        .map(|o| AdvisoryOutput {
            participant_id: o.participant_id.clone(),
            role: o.role.clone(),
            data: o.data.clone(),
            confidence: o.confidence,
        })
        .collect();
    let agreeing = 1 + advisory
        .iter()
        .filter(|a| normalize(&a.data) == decision)
        .count();

    Ok(Outcome {
        winner: Some(coordinator.role.clone()),
        merged: Some(coordinator.data.clone()),
        distribution: outputs
            .iter()
            .map(|o| {
                let share = if o.role == role { 1.0 } else { 0.0 };
                (o.role.clone(), share)
            })
            .collect(),
        consensus: agreeing as f64 / outputs.len() as f64,
        summary: format!(
            "coordinator '{}' decided; {} advisory output(s) attached",
            role,
            advisory.len()
        ),
        advisory,
        conflicts: Vec::new(),
    })
}

// ============================================================================
// Outcome validation
// ============================================================================

fn default_min_confidence() -> f64 {
    0.7
}

fn default_max_conflicts() -> usize {
    3
}

/// Acceptance criteria declared by an assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessCriteria {
    /// Keys the merged result must contain.
    #[serde(default)]
    pub required_outputs: Vec<String>,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_max_conflicts")]
    pub max_conflicts: usize,
}

impl Default for SuccessCriteria {
    fn default() -> Self {
        Self {
            required_outputs: Vec::new(),
            min_confidence: default_min_confidence(),
            max_conflicts: default_max_conflicts(),
        }
    }
}

/// Result of checking an outcome against success criteria.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub quality_score: f64,
}

pub fn validate_outcome(outcome: &Outcome, criteria: &SuccessCriteria) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for key in &criteria.required_outputs {
        let present = match &outcome.merged {
            Some(Value::Object(map)) => map.contains_key(key),
            Some(Value::Array(items)) => items
                .iter()
                .any(|item| item.as_object().is_some_and(|m| m.contains_key(key))),
            _ => false,
        };
        if !present {
            errors.push(format!("missing required output: {}", key));
        }
    }

    if outcome.consensus < criteria.min_confidence {
        errors.push(format!(
            "consensus {:.2} below minimum {:.2}",
            outcome.consensus, criteria.min_confidence
        ));
    }

    if outcome.conflicts.len() > criteria.max_conflicts {
        errors.push(format!(
            "{} conflicts exceed maximum {}",
            outcome.conflicts.len(),
            criteria.max_conflicts
        ));
    } else {
        for conflict in &outcome.conflicts {
            warnings.push(format!(
                "conflicting values for '{}', kept {}",
                conflict.key, conflict.chosen
            ));
        }
    }

    let quality_score = (outcome.consensus
        - 0.1 * errors.len() as f64
        - 0.05 * warnings.len() as f64)
        .clamp(0.0, 1.0);

    ValidationReport {
        is_valid: errors.is_empty(),
        errors,
        warnings,
        quality_score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn output(id: &str, role: &str, data: Value, confidence: f64) -> RoleOutput {
        RoleOutput {
            participant_id: id.to_string(),
            role: role.to_string(),
            data,
            confidence,
            weight: 1.0,
            recorded_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    fn ctx(expected: usize) -> AggregationContext {
        AggregationContext {
            expected,
            coordinator_role: None,
        }
    }

    #[test]
    fn test_strategy_tags_round_trip() {
        for (tag, strategy, _) in STRATEGIES {
            assert_eq!(tag.parse::<AggregationStrategy>().unwrap(), *strategy);
            assert_eq!(strategy.to_string(), *tag);
        }
        assert_eq!(
            "weighted_merge".parse::<AggregationStrategy>().unwrap(),
            AggregationStrategy::WeightedMerge
        );
        assert_eq!(
            "consensus-of-elders".parse::<AggregationStrategy>().unwrap_err(),
            UnknownStrategyError("consensus-of-elders".to_string())
        );
    }

    #[test]
    fn test_empty_outputs_no_quorum() {
        assert!(matches!(
            aggregate(AggregationStrategy::BestOf, &[], &ctx(3)),
            Err(TallyError::NoQuorum { .. })
        ));
    }

    #[test]
    fn test_best_of_returns_exact_output() {
        let outputs = vec![
            output("w1", "drafter", json!({"text": "low"}), 0.4),
            output("w2", "reviewer", json!({"text": "high", "score": 9}), 0.9),
            output("w3", "editor", json!({"text": "mid"}), 0.6),
        ];
        let outcome = aggregate(AggregationStrategy::BestOf, &outputs, &ctx(3)).unwrap();
        assert_eq!(outcome.merged, Some(json!({"text": "high", "score": 9})));
        assert_eq!(outcome.winner.as_deref(), Some("reviewer"));
        assert!((outcome.consensus - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_best_of_tie_goes_to_first_dispatched() {
        let outputs = vec![
            output("w1", "a", json!("first"), 0.8),
            output("w2", "b", json!("second"), 0.8),
        ];
        let outcome = aggregate(AggregationStrategy::BestOf, &outputs, &ctx(2)).unwrap();
        assert_eq!(outcome.merged, Some(json!("first")));
    }

    #[test]
    fn test_majority_normalises_strings() {
        let outputs = vec![
            output("w1", "a", json!("Approve"), 0.5),
            output("w2", "b", json!("reject"), 0.9),
            output("w3", "c", json!("  approve "), 0.5),
        ];
        let outcome = aggregate(AggregationStrategy::Majority, &outputs, &ctx(3)).unwrap();
        assert_eq!(outcome.winner.as_deref(), Some("approve"));
        assert_eq!(outcome.merged, Some(json!("Approve")));
        assert!((outcome.consensus - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_weighted_merge_numbers_and_conflicts() {
        let outputs = vec![
            output("w1", "a", json!({"score": 10.0, "verdict": "ship"}), 0.5),
            output("w2", "b", json!({"score": 20.0, "verdict": "hold"}), 1.0),
        ];
        let outcome = aggregate(AggregationStrategy::WeightedMerge, &outputs, &ctx(2)).unwrap();
        let merged = outcome.merged.unwrap();
        let score = merged["score"].as_f64().unwrap();
        assert!((score - 50.0 / 3.0).abs() < 1e-9);
        assert_eq!(merged["verdict"], json!("hold"));
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].key, "verdict");
        assert!((outcome.distribution["w2"] - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_weighted_merge_scalars() {
        let outputs = vec![
            output("w1", "a", json!(1.0), 1.0),
            output("w2", "b", json!(3.0), 1.0),
        ];
        let outcome = aggregate(AggregationStrategy::WeightedMerge, &outputs, &ctx(2)).unwrap();
        assert_eq!(outcome.merged, Some(json!(2.0)));
        assert!(outcome.conflicts.is_empty());
        assert_eq!(outcome.consensus, 1.0);
    }

    #[test]
    fn test_weighted_merge_zero_weight_fails() {
        let outputs = vec![output("w1", "a", json!(1.0), 0.0)];
        assert!(matches!(
            aggregate(AggregationStrategy::WeightedMerge, &outputs, &ctx(1)),
            Err(TallyError::NoQuorum { .. })
        ));
    }

    #[test]
    fn test_concatenation_dedups_in_order() {
        let outputs = vec![
            output("w1", "a", json!("x"), 0.5),
            output("w2", "b", json!("y"), 0.5),
            output("w3", "c", json!("X"), 0.5),
        ];
        let outcome = aggregate(AggregationStrategy::Concatenation, &outputs, &ctx(4)).unwrap();
        assert_eq!(outcome.merged, Some(json!(["x", "y"])));
        assert!(outcome.winner.is_none());
        assert!((outcome.consensus - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_voting_over_role_outputs() {
        let outputs = vec![
            output("w1", "a", json!({"option": "merge", "why": "tests pass"}), 0.9),
            output("w2", "b", json!({"option": "revise"}), 0.6),
            output("w3", "c", json!({"option": "merge"}), 0.3),
        ];
        let outcome = aggregate(AggregationStrategy::Voting, &outputs, &ctx(3)).unwrap();
        assert_eq!(outcome.winner.as_deref(), Some("merge"));
        assert_eq!(outcome.merged, Some(json!({"option": "merge", "why": "tests pass"})));
        assert!((outcome.consensus - 1.2 / 1.8).abs() < 1e-9);
    }

    #[test]
    fn test_hierarchical() {
        let outputs = vec![
            output("w1", "analyst", json!("go"), 0.9),
            output("w2", "lead", json!("Go"), 0.7),
            output("w3", "critic", json!("stop"), 0.8),
        ];
        let context = AggregationContext {
            expected: 3,
            coordinator_role: Some("lead".to_string()),
        };
        let outcome = aggregate(AggregationStrategy::Hierarchical, &outputs, &context).unwrap();
        assert_eq!(outcome.merged, Some(json!("Go")));
        assert_eq!(outcome.advisory.len(), 2);
        assert!((outcome.consensus - 2.0 / 3.0).abs() < 1e-12);

        let missing = AggregationContext {
            expected: 3,
            coordinator_role: Some("chair".to_string()),
        };
        assert_eq!(
            aggregate(AggregationStrategy::Hierarchical, &outputs, &missing).unwrap_err(),
            TallyError::CoordinatorUnavailable("chair".to_string())
        );
    }

    #[test]
    fn test_validate_outcome() {
        let outcome = Outcome {
            winner: None,
            merged: Some(json!({"summary": "ok"})),
            distribution: BTreeMap::new(),
            consensus: 0.9,
            summary: String::new(),
            advisory: vec![],
            conflicts: vec![MergeConflict {
                key: "summary".to_string(),
                values: vec![json!("ok"), json!("meh")],
                chosen: json!("ok"),
            }],
        };
        let criteria = SuccessCriteria {
            required_outputs: vec!["summary".to_string(), "risks".to_string()],
            ..SuccessCriteria::default()
        };
        let report = validate_outcome(&outcome, &criteria);
        assert!(!report.is_valid);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.warnings.len(), 1);
        assert!((report.quality_score - 0.75).abs() < 1e-9);

        let lenient = validate_outcome(&outcome, &SuccessCriteria::default());
        assert!(lenient.is_valid);
    }
}
