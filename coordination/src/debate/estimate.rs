//! Running consensus estimate and the early-stop rule.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::registry::ParticipantId;
use crate::session::{RoundOutcome, Turn};

/// Agreement over the positions stated in one round.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConsensusEstimate {
    /// Position carrying the most weight.
    pub leading: Option<String>,
    /// Leading position's share of all responding weight (0.0–1.0).
    pub score: f64,
    /// Responses that stated a position.
    pub counted: usize,
}

impl ConsensusEstimate {
    /// Estimate from a round's completed responses.
    ///
    /// Every completed response carries participant weight × confidence.
    /// Only stated positions compete for the lead, but responses without a
    /// position still count towards the total the score is taken over. Ties
    /// go to the lexicographically smallest position.
    pub fn from_turns(turns: &[Turn], weights: &HashMap<ParticipantId, f64>) -> Self {
        let mut totals: BTreeMap<&str, f64> = BTreeMap::new();
        let mut total = 0.0;
        let mut counted = 0;
        for turn in turns.iter().filter(|t| t.is_completed()) {
            let Some(response) = turn.content.as_ref().and_then(|c| c.as_response()) else {
                continue;
            };
            let confidence = if response.confidence.is_finite() {
                response.confidence.clamp(0.0, 1.0)
            } else {
                0.0
            };
            let weight = weights.get(&turn.participant_id).copied().unwrap_or(1.0) * confidence;
            total += weight;
            if let Some(position) = response.position.as_deref() {
                *totals.entry(position).or_insert(0.0) += weight;
                counted += 1;
            }
        }

        let mut leading: Option<(&str, f64)> = None;
        for (&position, &weight) in &totals {
            if leading.map_or(true, |(_, top)| weight > top) {
                leading = Some((position, weight));
            }
        }

        match leading {
            Some((position, weight)) if total > 0.0 => Self {
                leading: Some(position.to_string()),
                score: (weight / total).clamp(0.0, 1.0),
                counted,
            },
            _ => Self {
                leading: None,
                score: 0.0,
                counted,
            },
        }
    }

    /// Copy the estimate onto a round summary.
    pub fn annotate(&self, outcome: &mut RoundOutcome) {
        outcome.consensus_estimate = Some(self.score);
        outcome.leading_position = self.leading.clone();
    }
}

/// Ends discussion once a quorate round agrees strongly enough.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EarlyStop {
    pub threshold: f64,
}

impl EarlyStop {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Stops only when the score strictly exceeds the threshold. Quorum is
    /// checked independently: a round that missed quorum never stops
    /// discussion early, however unanimous its respondents were.
    pub fn should_stop(&self, estimate: &ConsensusEstimate, quorum_met: bool) -> bool {
        quorum_met && estimate.leading.is_some() && estimate.score > self.threshold
    }
}
