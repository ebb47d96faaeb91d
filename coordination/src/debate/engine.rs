//! Debate engine — drives one council from formation to a tallied vote.

use std::collections::HashMap;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::estimate::{ConsensusEstimate, EarlyStop};
use crate::agent::{Ballot, PriorContribution, ProviderError, ResponseContext};
use crate::config::{DebatePolicy, EngineConfig};
use crate::error::EngineError;
use crate::events::{EventBus, SharedEventBus};
use crate::queue::{Topic, WorkSource};
use crate::registry::{ParticipantId, SessionMember, SharedCapabilityRegistry};
use crate::scheduler::{DiscussionMode, Dispatch, Invocation, TurnScheduler};
use crate::selection::Selector;
use crate::session::driver::{weights_of, SessionDriver};
use crate::session::{FailureReason, Round, SessionKind, SessionPhase, TurnContent};
use crate::tally::{tally_votes, TallyError};
use crate::transcript::SessionRecord;

/// Runs debate councils over participants drawn from a registry.
pub struct DebateEngine {
    registry: SharedCapabilityRegistry,
    selector: Selector,
    policy: DebatePolicy,
    events: SharedEventBus,
}

impl DebateEngine {
    /// Create an engine. The configuration is validated here so a run never
    /// starts with settings it cannot honour.
    pub fn new(registry: SharedCapabilityRegistry, config: &EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            registry,
            selector: Selector::new(config.selection.clone()),
            policy: config.debate.clone(),
            events: EventBus::new().shared(),
        })
    }

    pub fn with_events(mut self, events: SharedEventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &SharedEventBus {
        &self.events
    }

    pub fn policy(&self) -> &DebatePolicy {
        &self.policy
    }

    /// Dequeue the next topic and debate it.
    pub async fn run_next<S>(&self, source: &S, cancel: &CancellationToken) -> Option<SessionRecord>
    where
        S: WorkSource<Topic> + ?Sized,
    {
        let topic = source.next().await?;
        Some(self.run(topic, None, cancel).await)
    }

    /// Run one debate to a terminal phase.
    ///
    /// Failures never escape as errors: the returned record ends in `error`
    /// with its [`FailureReason`].
    pub async fn run(
        &self,
        topic: Topic,
        seed: Option<&[u8]>,
        cancel: &CancellationToken,
    ) -> SessionRecord {
        let mut driver = SessionDriver::new(SessionKind::Debate, &topic.title, self.events.clone());
        info!(session_id = %driver.id(), topic = %topic.title, "Debate started");

        let mut council: Vec<SessionMember> = Vec::new();
        if let Err(reason) = self.drive(&mut driver, &topic, seed, cancel, &mut council).await {
            driver.halt(reason);
        }

        let session = driver.finish();
        info!(
            session_id = %session.id,
            phase = %session.phase,
            rounds = session.rounds.len(),
            "Debate finished"
        );
        let participants = council.into_iter().map(|m| m.participant).collect();
        SessionRecord::from_session(session, participants).with_topic(topic)
    }

    async fn drive(
        &self,
        driver: &mut SessionDriver,
        topic: &Topic,
        seed: Option<&[u8]>,
        cancel: &CancellationToken,
        council: &mut Vec<SessionMember>,
    ) -> Result<(), FailureReason> {
        // Forming
        driver.check_cancelled(cancel)?;
        let pool = self.registry.snapshot().await;
        let registration: HashMap<ParticipantId, usize> = pool
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id().to_string(), i))
            .collect();
        let available = pool.len();
        let formation = self.selector.select(pool, seed).map_err(|e| {
            warn!(session_id = %driver.id(), error = %e, "Council formation failed");
            FailureReason::InsufficientPool { available }
        })?;
        let seed_hex = formation.seed_hex();
        *council = formation.members;
        driver.seat(council.iter().map(|m| m.id().to_string()).collect(), seed_hex)?;

        let weights = weights_of(council);
        let mut speaking = council.clone();
        speaking.sort_by_key(|m| registration.get(m.id()).copied().unwrap_or(usize::MAX));

        let scheduler =
            TurnScheduler::new(self.policy.turn_timeout()).with_registry(self.registry.clone());
        let mut history: Vec<PriorContribution> = Vec::new();

        // Opening
        driver.advance(SessionPhase::Opening, "council formed")?;
        self.response_round(driver, &scheduler, council, Dispatch::Concurrent, topic, &mut history, &weights, cancel)
            .await?;

        // Debating
        if self.policy.max_rounds == 0 {
            driver.advance(SessionPhase::Voting, "no discussion rounds configured")?;
        } else {
            driver.advance(SessionPhase::Debating, "opening statements collected")?;
            let (dispatch, members) = match self.policy.discussion_mode {
                DiscussionMode::Sequential => (Dispatch::Sequential, speaking.as_slice()),
                DiscussionMode::Blind => (Dispatch::Concurrent, council.as_slice()),
            };
            let rule = EarlyStop::new(self.policy.early_stop_threshold);
            let mut reason = format!("{} discussion round(s) completed", self.policy.max_rounds);
            for n in 1..=self.policy.max_rounds {
                driver.check_cancelled(cancel)?;
                let (estimate, quorum_met) = self
                    .response_round(driver, &scheduler, members, dispatch, topic, &mut history, &weights, cancel)
                    .await?;
                if rule.should_stop(&estimate, quorum_met) {
                    info!(
                        session_id = %driver.id(),
                        round = n,
                        estimate = estimate.score,
                        leading = ?estimate.leading,
                        "Consensus reached early"
                    );
                    reason = format!(
                        "early stop after discussion round {}: consensus estimate {:.2}",
                        n, estimate.score
                    );
                    break;
                }
            }
            driver.advance(SessionPhase::Voting, &reason)?;
        }

        // Voting
        driver.check_cancelled(cancel)?;
        let ballot = Ballot {
            session_id: driver.id().to_string(),
            topic: topic.clone(),
            options: topic.ballot_options(),
        };
        let mut collector = driver.collector(driver.open_round(council), self.policy.quorum_policy());
        let invoke = |member: &SessionMember, _round: &Round| -> Invocation {
            let agent = member.agent.clone();
            let ballot = ballot.clone();
            async move {
                let vote = agent.vote(&ballot).await?;
                if !ballot.contains(&vote.option) {
                    return Err(ProviderError::malformed(format!(
                        "vote for '{}' is not on the ballot",
                        vote.option
                    )));
                }
                Ok(TurnContent::Vote(vote))
            }
            .boxed()
        };
        let end = scheduler
            .run_round(&mut collector, council, Dispatch::Concurrent, invoke, cancel)
            .await;

        let mut tally = None;
        driver.settle(collector, end, |round| {
            let result = tally_votes(&round.turns, &weights);
            if let (Some(summary), Ok(outcome)) = (round.outcome.as_mut(), &result) {
                summary.outcome = Some(outcome.clone());
            }
            tally = Some(result);
        })?;

        // Concluded
        driver.advance(SessionPhase::Concluded, "ballots collected")?;
        match tally {
            Some(Ok(outcome)) => driver.conclude(outcome),
            Some(Err(e @ TallyError::NonFiniteTotal { .. })) => {
                warn!(session_id = %driver.id(), error = %e, "Tally rejected the ballots");
                Err(FailureReason::TallyFailed {
                    reason: e.to_string(),
                })
            }
            Some(Err(e)) => {
                warn!(session_id = %driver.id(), error = %e, "Tally produced no outcome");
                let (responded, expected) = driver
                    .session()
                    .rounds
                    .last()
                    .map(|r| (r.responded(), r.expected()))
                    .unwrap_or((0, council.len()));
                Err(FailureReason::NoQuorum {
                    phase: SessionPhase::Concluded,
                    responded,
                    expected,
                })
            }
            None => Err(FailureReason::NoQuorum {
                phase: SessionPhase::Concluded,
                responded: 0,
                expected: council.len(),
            }),
        }
    }

    /// One opening or discussion round. Returns the round's consensus
    /// estimate and whether it met quorum.
    #[allow(clippy::too_many_arguments)]
    async fn response_round(
        &self,
        driver: &mut SessionDriver,
        scheduler: &TurnScheduler,
        members: &[SessionMember],
        dispatch: Dispatch,
        topic: &Topic,
        history: &mut Vec<PriorContribution>,
        weights: &HashMap<ParticipantId, f64>,
        cancel: &CancellationToken,
    ) -> Result<(ConsensusEstimate, bool), FailureReason> {
        let round = driver.open_round(members);
        let (index, phase) = (round.index, round.phase);
        let session_id = driver.id().to_string();
        let mut collector = driver.collector(round, self.policy.quorum_policy());

        let earlier: &[PriorContribution] = history;
        let invoke = |member: &SessionMember, current: &Round| -> Invocation {
            let agent = member.agent.clone();
            // Concurrent dispatch builds every context before any arrival,
            // so only sequential speakers see this round's earlier turns.
            let mut prior = earlier.to_vec();
            prior.extend(contributions(current));
            let context = ResponseContext {
                session_id: session_id.clone(),
                topic: topic.clone(),
                phase,
                round_index: index,
                prior,
            };
            async move { agent.respond(&context).await.map(TurnContent::Response) }.boxed()
        };
        let end = scheduler
            .run_round(&mut collector, members, dispatch, invoke, cancel)
            .await;

        let mut estimate = ConsensusEstimate::default();
        let mut quorum_met = false;
        let mut spoken = Vec::new();
        driver.settle(collector, end, |round| {
            estimate = ConsensusEstimate::from_turns(&round.turns, weights);
            if let Some(summary) = round.outcome.as_mut() {
                estimate.annotate(summary);
                quorum_met = summary.quorum_met;
            }
            spoken = contributions(round);
        })?;
        history.extend(spoken);
        Ok((estimate, quorum_met))
    }
}

/// Completed responses of a round in turn order.
fn contributions(round: &Round) -> Vec<PriorContribution> {
    round
        .completed_turns()
        .filter_map(|turn| {
            let response = turn.content.as_ref()?.as_response()?;
            Some(PriorContribution {
                participant_id: turn.participant_id.clone(),
                round_index: round.index,
                phase: round.phase,
                content: response.content.clone(),
                position: response.position.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::agent::{Agent, ScriptedAgent};
    use crate::registry::{CapabilityRegistry, Participant};
    use crate::session::TurnStatus;

    async fn registry(agents: Vec<ScriptedAgent>) -> SharedCapabilityRegistry {
        let registry = CapabilityRegistry::new().shared();
        for agent in agents {
            let id = agent.id().to_string();
            registry
                .register(Participant::new(id, ["general"]), agent.shared())
                .await
                .unwrap();
        }
        registry
    }

    fn engine(registry: SharedCapabilityRegistry, config: EngineConfig) -> DebateEngine {
        DebateEngine::new(registry, &config).unwrap()
    }

    fn topic() -> Topic {
        Topic::new("t-1", "Adopt the proposal").with_options(["A", "B"])
    }

    #[tokio::test]
    async fn test_unanimous_debate() {
        let agents = (0..5)
            .map(|i| ScriptedAgent::new(format!("a{}", i)).with_position("A").voting("A", 1.0))
            .collect();
        let engine = engine(registry(agents).await, EngineConfig::default());
        let record = engine.run(topic(), Some(b"seed".as_slice()), &CancellationToken::new()).await;

        assert_eq!(record.phase, SessionPhase::Archived);
        let outcome = record.outcome.as_ref().unwrap();
        assert_eq!(outcome.winner.as_deref(), Some("A"));
        assert_eq!(outcome.consensus, 1.0);
        assert_eq!(record.participants.len(), 5);
        assert_eq!(record.seed, hex::encode(b"seed"));
    }

    #[tokio::test]
    async fn test_early_stop_skips_remaining_rounds() {
        let agents = (0..3)
            .map(|i| ScriptedAgent::new(format!("a{}", i)).with_position("A").voting("A", 1.0))
            .collect();
        let mut config = EngineConfig::default();
        config.debate.max_rounds = 3;
        let record = engine(registry(agents).await, config)
            .run(topic(), None, &CancellationToken::new())
            .await;

        let debating = record
            .rounds
            .iter()
            .filter(|r| r.phase == SessionPhase::Debating)
            .count();
        assert_eq!(debating, 1);
        let stop = record
            .transitions
            .iter()
            .find(|t| t.to == SessionPhase::Voting)
            .unwrap();
        assert!(stop.reason.starts_with("early stop"));
    }

    #[tokio::test]
    async fn test_no_discussion_rounds_goes_straight_to_voting() {
        let agents = (0..2)
            .map(|i| ScriptedAgent::new(format!("a{}", i)).voting("B", 1.0))
            .collect();
        let mut config = EngineConfig::default();
        config.debate.max_rounds = 0;
        let record = engine(registry(agents).await, config)
            .run(topic(), None, &CancellationToken::new())
            .await;

        let phases: Vec<SessionPhase> = record.transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            phases,
            vec![
                SessionPhase::Opening,
                SessionPhase::Voting,
                SessionPhase::Concluded,
                SessionPhase::Archived
            ]
        );
        assert_eq!(record.outcome.unwrap().winner.as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn test_sequential_rounds_follow_registration_order() {
        let agents = vec![
            ScriptedAgent::new("first").with_statement("opening gambit"),
            ScriptedAgent::new("second"),
        ];
        let mut config = EngineConfig::default();
        config.debate.max_rounds = 1;
        config.debate.early_stop_threshold = 1.0;
        let record = engine(registry(agents).await, config)
            .run(topic(), None, &CancellationToken::new())
            .await;

        let debate_round = record
            .rounds
            .iter()
            .find(|r| r.phase == SessionPhase::Debating)
            .unwrap();
        let order: Vec<&str> = debate_round
            .turns
            .iter()
            .map(|t| t.participant_id.as_str())
            .collect();
        assert_eq!(order, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_off_ballot_vote_is_failed_turn() {
        let agents = vec![
            ScriptedAgent::new("a").voting("A", 1.0),
            ScriptedAgent::new("b").voting("A", 1.0),
            ScriptedAgent::new("rogue").voting("Z", 1.0),
        ];
        let mut config = EngineConfig::default();
        config.debate.max_rounds = 0;
        let record = engine(registry(agents).await, config)
            .run(topic(), None, &CancellationToken::new())
            .await;

        let voting = record.rounds.last().unwrap();
        assert_eq!(voting.turn("rogue").unwrap().status, TurnStatus::Failed);
        assert_eq!(record.outcome.unwrap().winner.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_overflowing_ballot_weight_fails_tally() {
        let agents = vec![
            ScriptedAgent::new("a").voting("A", f64::MAX * 0.6),
            ScriptedAgent::new("b").voting("B", f64::MAX * 0.6),
        ];
        let mut config = EngineConfig::default();
        config.debate.max_rounds = 0;
        let record = engine(registry(agents).await, config)
            .run(topic(), None, &CancellationToken::new())
            .await;

        assert_eq!(record.phase, SessionPhase::Error);
        assert!(record.outcome.is_none());
        assert!(matches!(
            record.failure,
            Some(FailureReason::TallyFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_registry_is_insufficient_pool() {
        let engine = engine(CapabilityRegistry::new().shared(), EngineConfig::default());
        let record = engine.run(topic(), None, &CancellationToken::new()).await;
        assert_eq!(record.phase, SessionPhase::Error);
        assert_eq!(
            record.failure,
            Some(FailureReason::InsufficientPool { available: 0 })
        );
        assert!(record.participants.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_voters_time_out() {
        let agents = (0..5)
            .map(|i| {
                ScriptedAgent::new(format!("a{}", i))
                    .voting("A", 1.0)
                    .with_vote_delay(Duration::from_secs(120))
            })
            .collect();
        let mut config = EngineConfig::default();
        config.debate.max_rounds = 0;
        let record = engine(registry(agents).await, config)
            .run(topic(), None, &CancellationToken::new())
            .await;

        assert_eq!(record.phase, SessionPhase::Error);
        assert!(matches!(
            record.failure,
            Some(FailureReason::NoQuorum {
                phase: SessionPhase::Voting,
                responded: 0,
                expected: 5
            })
        ));
        assert!(record.outcome.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let agents = vec![ScriptedAgent::new("a")];
        let engine = engine(registry(agents).await, EngineConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let record = engine.run(topic(), None, &cancel).await;
        assert_eq!(
            record.failure,
            Some(FailureReason::Cancelled {
                phase: SessionPhase::Forming
            })
        );
    }

    #[tokio::test]
    async fn test_run_next_drains_queue() {
        let queue = crate::queue::RankedQueue::new();
        queue.push(Topic::new("low", "Low").with_rank(1.0)).await;
        queue.push(Topic::new("high", "High").with_rank(5.0)).await;

        let agents = vec![ScriptedAgent::new("a")];
        let engine = engine(registry(agents).await, EngineConfig::default());
        let cancel = CancellationToken::new();

        let first = engine.run_next(&queue, &cancel).await.unwrap();
        assert_eq!(first.topic.unwrap().id, "high");
        assert!(engine.run_next(&queue, &cancel).await.is_some());
        assert!(engine.run_next(&queue, &cancel).await.is_none());
    }
}
