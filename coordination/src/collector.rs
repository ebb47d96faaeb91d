//! Collector: exactly-once turn accumulation for one round.
//!
//! A collector is owned by the single loop draining a round's arrival
//! channel, so concurrent invocations never touch the round directly. Each
//! participant's turn moves out of `Pending` at most once; anything arriving
//! afterwards (duplicates, stragglers after close) is logged and dropped.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::events::{CouncilEvent, SharedEventBus};
use crate::registry::ParticipantId;
use crate::session::{Round, TurnContent, TurnStatus};

/// Fractions governing when a round may close.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuorumPolicy {
    /// Minimum responded fraction.
    pub quorum: f64,
    /// Failed + timed-out fraction above which the round fails.
    pub failure_fraction: f64,
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        Self {
            quorum: 0.6,
            failure_fraction: 0.5,
        }
    }
}

/// Tolerance for fraction comparisons.
const EPSILON: f64 = 1e-9;

/// How one invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrivalResult {
    Content(TurnContent),
    Failed(String),
    TimedOut,
}

/// A finished invocation on its way to the collector.
#[derive(Debug, Clone, PartialEq)]
pub struct Arrival {
    pub participant_id: ParticipantId,
    pub result: ArrivalResult,
    pub duration_ms: u64,
}

impl Arrival {
    pub fn content(participant_id: &str, content: TurnContent, duration_ms: u64) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            result: ArrivalResult::Content(content),
            duration_ms,
        }
    }

    pub fn failed(participant_id: &str, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            result: ArrivalResult::Failed(error.into()),
            duration_ms,
        }
    }

    pub fn timed_out(participant_id: &str, duration_ms: u64) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            result: ArrivalResult::TimedOut,
            duration_ms,
        }
    }
}

/// What happened to an arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Recorded(TurnStatus),
    /// The participant's turn was already terminal.
    Duplicate,
    /// The participant is not part of this round.
    UnknownParticipant,
    /// The round has already closed.
    Closed,
}

/// Whether a closed round lets the session proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundVerdict {
    Proceed,
    NoQuorum { responded: usize, expected: usize },
    FailureThresholdExceeded { failed: usize, expected: usize },
}

/// Accumulates arrivals for one round.
pub struct Collector {
    session_id: String,
    round: Round,
    policy: QuorumPolicy,
    events: Option<SharedEventBus>,
    closed: bool,
}

impl Collector {
    pub fn new(session_id: &str, round: Round, policy: QuorumPolicy) -> Self {
        Self {
            session_id: session_id.to_string(),
            round,
            policy,
            events: None,
            closed: false,
        }
    }

    pub fn with_events(mut self, events: SharedEventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn round(&self) -> &Round {
        &self.round
    }

    /// Record an arrival. Exactly one arrival per participant is applied.
    pub fn observe(&mut self, arrival: Arrival) -> Observation {
        if self.closed {
            self.discard(&arrival.participant_id, "round closed");
            return Observation::Closed;
        }

        let index = self.round.index;
        let Some(turn) = self.round.turn_mut(&arrival.participant_id) else {
            self.discard(&arrival.participant_id, "not seated in this round");
            return Observation::UnknownParticipant;
        };
        if turn.status.is_terminal() {
            self.discard(&arrival.participant_id, "duplicate arrival");
            return Observation::Duplicate;
        }

        turn.duration_ms = arrival.duration_ms;
        turn.recorded_at = Some(Utc::now());
        match arrival.result {
            ArrivalResult::Content(content) => {
                turn.status = TurnStatus::Completed;
                turn.content = Some(content);
            }
            ArrivalResult::Failed(error) => {
                warn!(
                    session_id = %self.session_id,
                    round = index,
                    participant = %arrival.participant_id,
                    error = %error,
                    "Turn failed"
                );
                turn.status = TurnStatus::Failed;
                turn.error = Some(error);
            }
            ArrivalResult::TimedOut => {
                warn!(
                    session_id = %self.session_id,
                    round = index,
                    participant = %arrival.participant_id,
                    duration_ms = arrival.duration_ms,
                    "Turn timed out"
                );
                turn.status = TurnStatus::TimedOut;
                turn.error = Some(format!("no response within {}ms", arrival.duration_ms));
            }
        }

        let status = turn.status;
        debug!(
            session_id = %self.session_id,
            round = index,
            participant = %arrival.participant_id,
            status = %status,
            "Turn recorded"
        );
        if let Some(events) = &self.events {
            events.publish(CouncilEvent::TurnRecorded {
                session_id: self.session_id.clone(),
                round: index,
                participant_id: arrival.participant_id,
                status,
                duration_ms: arrival.duration_ms,
                timestamp: Utc::now(),
            });
        }
        Observation::Recorded(status)
    }

    fn discard(&self, participant_id: &str, reason: &str) {
        warn!(
            session_id = %self.session_id,
            round = self.round.index,
            participant = %participant_id,
            reason,
            "Arrival discarded"
        );
        if let Some(events) = &self.events {
            events.publish(CouncilEvent::ArrivalDiscarded {
                session_id: self.session_id.clone(),
                round: self.round.index,
                participant_id: participant_id.to_string(),
                reason: reason.to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    /// Mark every still-pending turn with `status`. Returns how many changed.
    pub fn expire_pending(&mut self, status: TurnStatus, note: &str) -> usize {
        let mut expired = 0;
        for turn in self.round.turns.iter_mut().filter(|t| !t.status.is_terminal()) {
            turn.status = status;
            turn.error = Some(note.to_string());
            turn.recorded_at = Some(Utc::now());
            expired += 1;
        }
        if expired > 0 {
            warn!(
                session_id = %self.session_id,
                round = self.round.index,
                expired,
                status = %status,
                note,
                "Pending turns expired"
            );
        }
        expired
    }

    pub fn has_pending(&self) -> bool {
        self.round.pending() > 0
    }

    pub fn quorum_met(&self) -> bool {
        let expected = self.round.expected();
        expected > 0
            && self.round.responded() as f64 / expected as f64 + EPSILON >= self.policy.quorum
    }

    /// Transition guard: no turn pending, and everyone or a quorum responded.
    pub fn is_phase_complete(&self) -> bool {
        !self.has_pending()
            && (self.round.responded() == self.round.expected() || self.quorum_met())
    }

    /// Whether the session may proceed past this round.
    pub fn verdict(&self) -> RoundVerdict {
        let expected = self.round.expected();
        let responded = self.round.responded();
        if responded == 0 {
            return RoundVerdict::NoQuorum {
                responded,
                expected,
            };
        }
        let failed = self.round.unsuccessful();
        if failed as f64 / expected as f64 > self.policy.failure_fraction + EPSILON {
            return RoundVerdict::FailureThresholdExceeded { failed, expected };
        }
        if !self.is_phase_complete() {
            return RoundVerdict::NoQuorum {
                responded,
                expected,
            };
        }
        RoundVerdict::Proceed
    }

    /// Close the round and hand back the finished copy.
    ///
    /// Later arrivals are discarded.
    pub fn close(&mut self) -> Round {
        self.closed = true;
        self.round.close();
        self.round.outcome = Some(self.round.summarize(self.quorum_met()));
        if let Some(events) = &self.events {
            events.publish(CouncilEvent::RoundClosed {
                session_id: self.session_id.clone(),
                round: self.round.index,
                phase: self.round.phase,
                responded: self.round.responded(),
                expected: self.round.expected(),
                timestamp: Utc::now(),
            });
        }
        self.round.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentResponse;
    use crate::events::EventBus;
    use crate::session::SessionPhase;

    fn collector(n: usize) -> Collector {
        let ids: Vec<String> = (0..n).map(|i| format!("p{}", i)).collect();
        Collector::new(
            "s-1",
            Round::open(0, SessionPhase::Opening, &ids),
            QuorumPolicy::default(),
        )
    }

    fn response(text: &str) -> TurnContent {
        TurnContent::Response(AgentResponse {
            content: text.to_string(),
            confidence: 0.8,
            position: None,
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn test_exactly_once_per_participant() {
        let mut c = collector(2);
        assert_eq!(
            c.observe(Arrival::content("p0", response("first"), 5)),
            Observation::Recorded(TurnStatus::Completed)
        );
        assert_eq!(
            c.observe(Arrival::content("p0", response("second"), 6)),
            Observation::Duplicate
        );
        assert_eq!(
            c.observe(Arrival::timed_out("p0", 7)),
            Observation::Duplicate
        );

        let turn = c.round().turn("p0").unwrap();
        assert_eq!(
            turn.content.as_ref().unwrap().as_response().unwrap().content,
            "first"
        );
        assert_eq!(turn.duration_ms, 5);
    }

    #[test]
    fn test_arrivals_stamped_in_arrival_order() {
        use crate::agent::AgentVote;
        use crate::tally::tally_votes;
        use std::collections::HashMap;

        let ballot = |option: &str| {
            TurnContent::Vote(AgentVote {
                option: option.to_string(),
                weight: 1.0,
                reasoning: String::new(),
            })
        };
        let mut c = collector(3);
        c.observe(Arrival::content("p1", ballot("Zulu"), 5));
        std::thread::sleep(std::time::Duration::from_millis(2));
        c.observe(Arrival::content("p0", ballot("Alpha"), 1));
        c.expire_pending(TurnStatus::TimedOut, "deadline");

        let first = c.round().turn("p1").unwrap().recorded_at.unwrap();
        let second = c.round().turn("p0").unwrap().recorded_at.unwrap();
        assert!(first < second);
        assert!(c.round().turn("p2").unwrap().recorded_at.is_some());

        // Equal weight: the ballot that reached the collector first wins.
        let outcome = tally_votes(&c.round().turns, &HashMap::new()).unwrap();
        assert_eq!(outcome.winner.as_deref(), Some("Zulu"));
    }

    #[test]
    fn test_unknown_and_closed() {
        let mut c = collector(1);
        assert_eq!(
            c.observe(Arrival::failed("stranger", "who?", 1)),
            Observation::UnknownParticipant
        );
        let round = c.close();
        assert!(round.is_closed());
        assert_eq!(
            c.observe(Arrival::content("p0", response("late"), 1)),
            Observation::Closed
        );
        assert_eq!(c.round().pending(), 1);
    }

    #[test]
    fn test_phase_complete_requires_no_pending() {
        let mut c = collector(5);
        for i in 0..4 {
            c.observe(Arrival::content(&format!("p{}", i), response("ok"), 1));
        }
        assert!(c.quorum_met());
        assert!(!c.is_phase_complete());

        c.observe(Arrival::timed_out("p4", 30_000));
        assert!(c.is_phase_complete());
        assert_eq!(c.verdict(), RoundVerdict::Proceed);
    }

    #[test]
    fn test_below_quorum() {
        let mut c = collector(5);
        c.observe(Arrival::content("p0", response("ok"), 1));
        c.observe(Arrival::content("p1", response("ok"), 1));
        c.observe(Arrival::failed("p2", "quota", 1));
        c.expire_pending(TurnStatus::TimedOut, "deadline");
        assert!(!c.is_phase_complete());
        // 3/5 unsuccessful exceeds the 0.5 failure fraction first
        assert_eq!(
            c.verdict(),
            RoundVerdict::FailureThresholdExceeded {
                failed: 3,
                expected: 5
            }
        );
    }

    #[test]
    fn test_no_responses_is_no_quorum() {
        let mut c = collector(3);
        assert_eq!(c.expire_pending(TurnStatus::TimedOut, "deadline"), 3);
        assert_eq!(
            c.verdict(),
            RoundVerdict::NoQuorum {
                responded: 0,
                expected: 3
            }
        );
    }

    #[test]
    fn test_quorum_gate_with_lenient_failure_fraction() {
        let ids: Vec<String> = (0..5).map(|i| format!("p{}", i)).collect();
        let mut c = Collector::new(
            "s-1",
            Round::open(0, SessionPhase::Voting, &ids),
            QuorumPolicy {
                quorum: 0.6,
                failure_fraction: 1.0,
            },
        );
        c.observe(Arrival::content("p0", response("ok"), 1));
        c.observe(Arrival::content("p1", response("ok"), 1));
        c.expire_pending(TurnStatus::TimedOut, "deadline");
        assert_eq!(
            c.verdict(),
            RoundVerdict::NoQuorum {
                responded: 2,
                expected: 5
            }
        );
    }

    #[tokio::test]
    async fn test_events_published() {
        let bus = EventBus::new().shared();
        let mut rx = bus.subscribe();
        let mut c = collector(1).with_events(bus);

        c.observe(Arrival::content("p0", response("ok"), 1));
        c.observe(Arrival::content("p0", response("again"), 1));
        let round = c.close();

        assert_eq!(rx.recv().await.unwrap().event_type(), "turn_recorded");
        assert_eq!(rx.recv().await.unwrap().event_type(), "arrival_discarded");
        assert_eq!(rx.recv().await.unwrap().event_type(), "round_closed");
        assert!(round.outcome.unwrap().quorum_met);
    }
}
