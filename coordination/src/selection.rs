//! Selector: seeded, diversity-biased participant selection.
//!
//! Selection is replayable: the effective seed is returned with every
//! formation and recorded on the session, so the same pool, target size,
//! diversity target and seed always produce the same ordered council.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::registry::{Participant, SessionMember};

/// Error type for selection
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SelectionError {
    #[error("Insufficient pool: {available} participant(s) available")]
    InsufficientPool { available: usize },

    #[error("Target size must be at least 1")]
    ZeroTarget,

    #[error("Diversity target {0} outside [0, 1]")]
    InvalidDiversity(f64),
}

/// Anything that can be seated by the selector.
pub trait Candidate {
    fn participant(&self) -> &Participant;
}

impl Candidate for Participant {
    fn participant(&self) -> &Participant {
        self
    }
}

impl Candidate for SessionMember {
    fn participant(&self) -> &Participant {
        &self.participant
    }
}

/// Selector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Council size for debates.
    pub council_size: usize,
    /// Weight of capability dissimilarity in the pick score (0.0–1.0).
    pub diversity_target: f64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            council_size: 5,
            diversity_target: 0.5,
        }
    }
}

/// Result of a selection: the ordered members and the seed that produced them.
#[derive(Debug, Clone)]
pub struct Formation<T> {
    pub members: Vec<T>,
    pub seed: Vec<u8>,
}

impl<T> Formation<T> {
    pub fn seed_hex(&self) -> String {
        hex::encode(&self.seed)
    }
}

/// Derive the RNG for a seed. Any byte string is accepted.
pub fn rng_from_seed(seed: &[u8]) -> StdRng {
    StdRng::from_seed(*blake3::hash(seed).as_bytes())
}

/// Fresh random seed for callers that did not supply one.
pub fn fresh_seed() -> Vec<u8> {
    rand::thread_rng().gen::<[u8; 32]>().to_vec()
}

/// Chooses session participants.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    config: SelectionConfig,
}

impl Selector {
    pub fn new(config: SelectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SelectionConfig {
        &self.config
    }

    /// Form a council using the configured size and diversity target.
    pub fn select<T: Candidate>(
        &self,
        pool: Vec<T>,
        seed: Option<&[u8]>,
    ) -> Result<Formation<T>, SelectionError> {
        Self::form(
            pool,
            self.config.council_size,
            self.config.diversity_target,
            seed,
        )
    }

    /// Choose `min(target_size, pool.len())` members.
    ///
    /// The pool is sorted by id first so input order never matters. A pool no
    /// larger than the target is returned whole in seed-shuffled order;
    /// otherwise each pick takes the candidate maximising
    /// `r * (1 + diversity_target * dissimilarity)` where `r` is drawn from
    /// the seeded stream and dissimilarity is 1 minus the mean Jaccard
    /// similarity to the members already chosen.
    pub fn form<T: Candidate>(
        mut pool: Vec<T>,
        target_size: usize,
        diversity_target: f64,
        seed: Option<&[u8]>,
    ) -> Result<Formation<T>, SelectionError> {
        if pool.is_empty() {
            return Err(SelectionError::InsufficientPool { available: 0 });
        }
        if target_size == 0 {
            return Err(SelectionError::ZeroTarget);
        }
        if !(0.0..=1.0).contains(&diversity_target) {
            return Err(SelectionError::InvalidDiversity(diversity_target));
        }

        let seed = seed.map(<[u8]>::to_vec).unwrap_or_else(fresh_seed);
        let mut rng = rng_from_seed(&seed);
        pool.sort_by(|a, b| a.participant().id.cmp(&b.participant().id));

        if pool.len() <= target_size {
            pool.shuffle(&mut rng);
            debug!(size = pool.len(), seed = %hex::encode(&seed), "Whole pool seated");
            return Ok(Formation {
                members: pool,
                seed,
            });
        }

        let mut remaining = pool;
        let mut chosen: Vec<T> = Vec::with_capacity(target_size);
        while chosen.len() < target_size {
            let mut best: Option<(usize, f64)> = None;
            for (idx, candidate) in remaining.iter().enumerate() {
                let draw: f64 = rng.gen();
                let dissimilarity = dissimilarity(candidate.participant(), &chosen);
                let score = draw * (1.0 + diversity_target * dissimilarity);
                if best.map_or(true, |(_, top)| score > top) {
                    best = Some((idx, score));
                }
            }
            match best {
                Some((idx, _)) => chosen.push(remaining.remove(idx)),
                None => break,
            }
        }

        debug!(size = chosen.len(), seed = %hex::encode(&seed), "Council selected");
        Ok(Formation {
            members: chosen,
            seed,
        })
    }
}

/// 1 minus the mean Jaccard similarity to `chosen`; 1.0 when nothing is chosen.
fn dissimilarity<T: Candidate>(candidate: &Participant, chosen: &[T]) -> f64 {
    if chosen.is_empty() {
        return 1.0;
    }
    let total: f64 = chosen
        .iter()
        .map(|c| candidate.jaccard(c.participant()))
        .sum();
    1.0 - total / chosen.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> Vec<Participant> {
        (0..n)
            .map(|i| Participant::new(format!("p{:02}", i), [format!("cap-{}", i % 3)]))
            .collect()
    }

    fn ids(formation: &Formation<Participant>) -> Vec<String> {
        formation.members.iter().map(|p| p.id.clone()).collect()
    }

    #[test]
    fn test_empty_pool_fails() {
        let err = Selector::form(Vec::<Participant>::new(), 3, 0.5, None).unwrap_err();
        assert_eq!(err, SelectionError::InsufficientPool { available: 0 });
    }

    #[test]
    fn test_rejects_bad_parameters() {
        assert_eq!(
            Selector::form(pool(3), 0, 0.5, None).unwrap_err(),
            SelectionError::ZeroTarget
        );
        assert!(matches!(
            Selector::form(pool(3), 2, 1.5, None).unwrap_err(),
            SelectionError::InvalidDiversity(_)
        ));
    }

    #[test]
    fn test_size_is_min_of_target_and_pool() {
        for (n, target) in [(1, 5), (5, 5), (8, 3), (10, 1)] {
            let source = pool(n);
            let formation = Selector::form(source.clone(), target, 0.5, Some(b"seed".as_slice())).unwrap();
            assert_eq!(formation.members.len(), target.min(n));
            for member in &formation.members {
                assert!(source.contains(member));
            }
            let mut unique = ids(&formation);
            unique.sort();
            unique.dedup();
            assert_eq!(unique.len(), formation.members.len());
        }
    }

    #[test]
    fn test_deterministic_for_same_seed() {
        let a = Selector::form(pool(12), 5, 0.7, Some(b"audit-42".as_slice())).unwrap();
        let b = Selector::form(pool(12), 5, 0.7, Some(b"audit-42".as_slice())).unwrap();
        assert_eq!(ids(&a), ids(&b));
        assert_eq!(a.seed_hex(), b.seed_hex());
    }

    #[test]
    fn test_input_order_does_not_matter() {
        let mut reversed = pool(9);
        reversed.reverse();
        let a = Selector::form(pool(9), 4, 0.5, Some(b"x".as_slice())).unwrap();
        let b = Selector::form(reversed, 4, 0.5, Some(b"x".as_slice())).unwrap();
        assert_eq!(ids(&a), ids(&b));
    }

    #[test]
    fn test_whole_pool_is_seed_shuffled() {
        let a = Selector::form(pool(5), 5, 0.5, Some(b"one".as_slice())).unwrap();
        let again = Selector::form(pool(5), 5, 0.5, Some(b"one".as_slice())).unwrap();
        assert_eq!(ids(&a), ids(&again));

        let mut sorted = ids(&a);
        sorted.sort();
        assert_eq!(sorted, vec!["p00", "p01", "p02", "p03", "p04"]);
    }

    #[test]
    fn test_generated_seed_is_recorded_and_replayable() {
        let first = Selector::form(pool(10), 4, 0.5, None).unwrap();
        assert_eq!(first.seed.len(), 32);
        let replay = Selector::form(pool(10), 4, 0.5, Some(&first.seed)).unwrap();
        assert_eq!(ids(&first), ids(&replay));
    }

    #[test]
    fn test_dissimilarity() {
        let a = Participant::new("a", ["x"]);
        let b = Participant::new("b", ["x"]);
        let c = Participant::new("c", ["y"]);
        assert_eq!(dissimilarity::<Participant>(&a, &[]), 1.0);
        assert_eq!(dissimilarity(&a, &[b.clone()]), 0.0);
        assert_eq!(dissimilarity(&a, &[c.clone()]), 1.0);
        assert!((dissimilarity(&a, &[b, c]) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_diversity_raises_distinct_capabilities_seated() {
        let mut candidates: Vec<Participant> = (0..6)
            .map(|i| Participant::new(format!("shared-{}", i), ["x"]))
            .collect();
        for tag in ["y", "z", "w"] {
            candidates.push(Participant::new(format!("solo-{}", tag), [tag]));
        }

        let mean_distinct = |diversity: f64| {
            let mut total = 0usize;
            for s in 0..200u32 {
                let formation =
                    Selector::form(candidates.clone(), 3, diversity, Some(&s.to_le_bytes()))
                        .unwrap();
                let tags: std::collections::BTreeSet<&str> = formation
                    .members
                    .iter()
                    .flat_map(|p| p.capabilities.iter().map(String::as_str))
                    .collect();
                total += tags.len();
            }
            total as f64 / 200.0
        };

        let diverse = mean_distinct(1.0);
        let plain = mean_distinct(0.0);
        assert!(diverse > plain, "diverse {} vs plain {}", diverse, plain);
    }

    #[test]
    fn test_selector_uses_config() {
        let selector = Selector::new(SelectionConfig {
            council_size: 2,
            diversity_target: 1.0,
        });
        let formation = selector.select(pool(6), Some(b"cfg".as_slice())).unwrap();
        assert_eq!(formation.members.len(), 2);
    }
}
