//! Weighted vote consensus.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tracing::debug;

use super::{Outcome, TallyError};
use crate::registry::ParticipantId;
use crate::session::Turn;

/// One counted ballot with its effective weight.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedVote {
    pub voter: ParticipantId,
    pub option: String,
    /// Participant weight × ballot weight.
    pub weight: f64,
    /// When the collector accepted the ballot.
    pub recorded_at: DateTime<Utc>,
}

/// Tally the vote turns of a closed round.
///
/// Only completed turns carrying a vote count. Missing participant weights
/// default to 1.0. Ties are broken on the collector's `recorded_at` stamp; a
/// turn without one ranks after every stamped turn.
pub fn tally_votes(
    turns: &[Turn],
    weights: &HashMap<ParticipantId, f64>,
) -> Result<Outcome, TallyError> {
    let votes = turns
        .iter()
        .filter(|t| t.is_completed())
        .filter_map(|t| {
            let vote = t.content.as_ref()?.as_vote()?;
            let participant_weight = weights.get(&t.participant_id).copied().unwrap_or(1.0);
            Some(WeightedVote {
                voter: t.participant_id.clone(),
                option: vote.option.clone(),
                weight: participant_weight * vote.weight,
                recorded_at: t.recorded_at.unwrap_or(DateTime::<Utc>::MAX_UTC),
            })
        })
        .collect();
    tally_weighted(votes)
}

struct OptionTotal {
    weight: f64,
    votes: usize,
    earliest: DateTime<Utc>,
}

/// Sum effective weight per option and pick the winner.
///
/// Ties on summed weight go to the option holding the earliest-recorded
/// vote, then to the lexicographically smallest option. Votes with non-finite
/// or non-positive weight are not counted; a sum that overflows is rejected.
pub fn tally_weighted(mut votes: Vec<WeightedVote>) -> Result<Outcome, TallyError> {
    votes.retain(|v| v.weight.is_finite() && v.weight > 0.0);
    // Canonical order keeps floating-point sums identical across runs.
    votes.sort_by(|a, b| a.voter.cmp(&b.voter).then_with(|| a.option.cmp(&b.option)));

    let mut totals: BTreeMap<String, OptionTotal> = BTreeMap::new();
    for vote in &votes {
        let entry = totals.entry(vote.option.clone()).or_insert(OptionTotal {
            weight: 0.0,
            votes: 0,
            earliest: vote.recorded_at,
        });
        entry.weight += vote.weight;
        entry.votes += 1;
        entry.earliest = entry.earliest.min(vote.recorded_at);
    }

    let total: f64 = totals.values().map(|t| t.weight).sum();
    if !total.is_finite() {
        return Err(TallyError::NonFiniteTotal {
            counted: votes.len(),
        });
    }
    if votes.is_empty() || total <= 0.0 {
        return Err(TallyError::NoQuorum {
            counted: votes.len(),
        });
    }

    // BTreeMap iteration is lexicographic, so the first of equal candidates wins.
    let mut winner: Option<(&String, &OptionTotal)> = None;
    for (option, t) in &totals {
        winner = match winner {
            None => Some((option, t)),
            Some((_, best))
                if t.weight > best.weight
                    || (t.weight == best.weight && t.earliest < best.earliest) =>
            {
                Some((option, t))
            }
            keep => keep,
        };
    }
    let Some((winner, winning)) = winner else {
        return Err(TallyError::NoQuorum { counted: 0 });
    };

    let consensus = (winning.weight / total).clamp(0.0, 1.0);
    debug!(
        winner = %winner,
        votes = votes.len(),
        consensus,
        "Votes tallied"
    );

    Ok(Outcome {
        winner: Some(winner.clone()),
        merged: None,
        summary: format!(
            "{} wins with {:.1}% of counted weight ({} of {} votes)",
            winner,
            consensus * 100.0,
            winning.votes,
            votes.len()
        ),
        distribution: totals.iter().map(|(k, t)| (k.clone(), t.weight)).collect(),
        consensus,
        advisory: Vec::new(),
        conflicts: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentVote;
    use crate::session::{TurnContent, TurnStatus};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn vote(voter: &str, option: &str, weight: f64, secs: i64) -> WeightedVote {
        WeightedVote {
            voter: voter.to_string(),
            option: option.to_string(),
            weight,
            recorded_at: at(secs),
        }
    }

    fn vote_turn(voter: &str, option: &str, weight: f64, status: TurnStatus) -> Turn {
        Turn {
            status,
            content: Some(TurnContent::Vote(AgentVote {
                option: option.to_string(),
                weight,
                reasoning: String::new(),
            })),
            recorded_at: Some(at(0)),
            ..Turn::pending(voter)
        }
    }

    #[test]
    fn test_unanimous() {
        let votes = (0..5).map(|i| vote(&format!("p{}", i), "A", 1.0, i)).collect();
        let outcome = tally_weighted(votes).unwrap();
        assert_eq!(outcome.winner.as_deref(), Some("A"));
        assert_eq!(outcome.consensus, 1.0);
        assert_eq!(outcome.distribution["A"], 5.0);
    }

    #[test]
    fn test_weight_beats_headcount() {
        let votes = vec![
            vote("a", "X", 1.0, 0),
            vote("b", "X", 1.0, 1),
            vote("c", "Y", 3.0, 2),
        ];
        let outcome = tally_weighted(votes).unwrap();
        assert_eq!(outcome.winner.as_deref(), Some("Y"));
        assert!((outcome.consensus - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_equal_weights_more_votes_wins() {
        let votes = vec![
            vote("a", "B", 1.0, 0),
            vote("b", "A", 1.0, 1),
            vote("c", "B", 1.0, 2),
        ];
        assert_eq!(tally_weighted(votes).unwrap().winner.as_deref(), Some("B"));
    }

    #[test]
    fn test_tie_goes_to_earliest_cast() {
        let votes = vec![vote("a", "A", 1.0, 10), vote("b", "B", 1.0, 5)];
        let outcome = tally_weighted(votes).unwrap();
        assert_eq!(outcome.winner.as_deref(), Some("B"));
        assert!((outcome.consensus - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_tie_same_time_goes_to_smallest_option() {
        let votes = vec![vote("a", "Zulu", 2.0, 0), vote("b", "Alpha", 2.0, 0)];
        assert_eq!(
            tally_weighted(votes).unwrap().winner.as_deref(),
            Some("Alpha")
        );
    }

    #[test]
    fn test_zero_total_weight_is_no_quorum() {
        let votes = vec![vote("a", "A", 0.0, 0), vote("b", "B", 0.0, 0)];
        assert_eq!(
            tally_weighted(votes).unwrap_err(),
            TallyError::NoQuorum { counted: 0 }
        );
        assert!(tally_weighted(vec![]).is_err());
    }

    #[test]
    fn test_winner_weight_dominates() {
        let votes = vec![
            vote("a", "A", 0.3, 0),
            vote("b", "B", 0.7, 1),
            vote("c", "C", 0.2, 2),
            vote("d", "A", 0.5, 3),
        ];
        let outcome = tally_weighted(votes).unwrap();
        let top = outcome.distribution[outcome.winner.as_deref().unwrap()];
        assert!(outcome.distribution.values().all(|w| top >= *w));
    }

    #[test]
    fn test_tally_votes_applies_participant_weight_and_skips_failed() {
        let turns = vec![
            vote_turn("a", "A", 1.0, TurnStatus::Completed),
            vote_turn("b", "B", 1.0, TurnStatus::Completed),
            vote_turn("c", "B", 1.0, TurnStatus::TimedOut),
            Turn::pending("d"),
        ];
        let weights = HashMap::from([("a".to_string(), 2.5)]);
        let outcome = tally_votes(&turns, &weights).unwrap();
        assert_eq!(outcome.winner.as_deref(), Some("A"));
        assert_eq!(outcome.distribution.get("B"), Some(&1.0));
    }

    #[test]
    fn test_all_turns_excluded_is_no_quorum() {
        let turns = vec![
            vote_turn("a", "A", 1.0, TurnStatus::TimedOut),
            vote_turn("b", "A", 1.0, TurnStatus::Failed),
        ];
        assert!(matches!(
            tally_votes(&turns, &HashMap::new()),
            Err(TallyError::NoQuorum { .. })
        ));
    }

    #[test]
    fn test_tie_follows_collector_arrival_order() {
        // "Zulu" reached the collector first even though "Alpha" sorts first.
        let mut zulu = vote_turn("late-clock", "Zulu", 1.0, TurnStatus::Completed);
        zulu.recorded_at = Some(at(1));
        let mut alpha = vote_turn("early-clock", "Alpha", 1.0, TurnStatus::Completed);
        alpha.recorded_at = Some(at(2));

        let outcome = tally_votes(&[alpha.clone(), zulu.clone()], &HashMap::new()).unwrap();
        assert_eq!(outcome.winner.as_deref(), Some("Zulu"));

        // Swapping arrival order swaps the winner.
        zulu.recorded_at = Some(at(3));
        let outcome = tally_votes(&[alpha, zulu], &HashMap::new()).unwrap();
        assert_eq!(outcome.winner.as_deref(), Some("Alpha"));
    }

    #[test]
    fn test_unstamped_turn_loses_tie() {
        let mut unstamped = vote_turn("a", "Alpha", 1.0, TurnStatus::Completed);
        unstamped.recorded_at = None;
        let stamped = vote_turn("b", "Zulu", 1.0, TurnStatus::Completed);
        let outcome = tally_votes(&[unstamped, stamped], &HashMap::new()).unwrap();
        assert_eq!(outcome.winner.as_deref(), Some("Zulu"));
    }

    #[test]
    fn test_overflowing_total_is_rejected() {
        let votes = vec![
            vote("a", "A", f64::MAX / 2.0, 0),
            vote("b", "B", f64::MAX / 2.0, 1),
            vote("c", "C", f64::MAX / 2.0, 2),
        ];
        assert!(votes.iter().all(|v| v.weight.is_finite()));
        assert_eq!(
            tally_weighted(votes).unwrap_err(),
            TallyError::NonFiniteTotal { counted: 3 }
        );
    }

    #[test]
    fn test_idempotent() {
        let turns: Vec<Turn> = ["c", "a", "b"]
            .iter()
            .zip([0.1, 0.2, 0.3])
            .map(|(id, w)| vote_turn(id, if *id == "a" { "X" } else { "Y" }, w, TurnStatus::Completed))
            .collect();
        let mut shuffled = turns.clone();
        shuffled.reverse();
        let first = tally_votes(&turns, &HashMap::new()).unwrap();
        let second = tally_votes(&shuffled, &HashMap::new()).unwrap();
        assert_eq!(first, second);
    }
}
