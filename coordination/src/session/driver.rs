//! Session driver — phase bookkeeping shared by the debate and assembly engines.
//!
//! Engines run their phase logic against a [`SessionDriver`] and return a
//! [`FailureReason`] on the first problem; the driver applies transitions,
//! stores closed rounds, and publishes the matching events.

use std::collections::HashMap;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::round::Round;
use super::state::{FailureReason, Session, SessionKind, SessionPhase};
use crate::collector::{Collector, QuorumPolicy, RoundVerdict};
use crate::events::{CouncilEvent, SharedEventBus};
use crate::registry::{ParticipantId, SessionMember};
use crate::scheduler::RoundEnd;
use crate::tally::Outcome;

pub(crate) struct SessionDriver {
    session: Session,
    events: SharedEventBus,
}

impl SessionDriver {
    pub(crate) fn new(kind: SessionKind, subject: &str, events: SharedEventBus) -> Self {
        Self {
            session: Session::new(kind, subject),
            events,
        }
    }

    pub(crate) fn session(&self) -> &Session {
        &self.session
    }

    pub(crate) fn id(&self) -> &str {
        &self.session.id
    }

    pub(crate) fn seat(
        &mut self,
        participants: Vec<ParticipantId>,
        seed: String,
    ) -> Result<(), FailureReason> {
        self.session
            .seat(participants, seed)
            .map_err(|e| FailureReason::from(&e))?;
        info!(
            session_id = %self.session.id,
            kind = %self.session.kind,
            participants = ?self.session.participants,
            seed = %self.session.seed,
            "Session formed"
        );
        self.events.publish(CouncilEvent::SessionFormed {
            session_id: self.session.id.clone(),
            kind: self.session.kind,
            participants: self.session.participants.clone(),
            seed: self.session.seed.clone(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    pub(crate) fn advance(&mut self, to: SessionPhase, reason: &str) -> Result<(), FailureReason> {
        let from = self.session.phase;
        if let Err(e) = self.session.transition(to, reason) {
            warn!(session_id = %self.session.id, error = %e, "Transition rejected");
            return Err(FailureReason::from(&e));
        }
        info!(session_id = %self.session.id, from = %from, to = %to, reason, "Phase transition");
        self.publish_phase(from, to, reason);
        Ok(())
    }

    /// Fail with [`FailureReason::Cancelled`] if the token has fired.
    pub(crate) fn check_cancelled(&self, cancel: &CancellationToken) -> Result<(), FailureReason> {
        if cancel.is_cancelled() {
            return Err(FailureReason::Cancelled {
                phase: self.session.phase,
            });
        }
        Ok(())
    }

    /// Open the next round of the current phase.
    pub(crate) fn open_round(&self, members: &[SessionMember]) -> Round {
        let ids: Vec<ParticipantId> = members.iter().map(|m| m.id().to_string()).collect();
        Round::open(self.next_round_index(), self.session.phase, &ids)
    }

    pub(crate) fn next_round_index(&self) -> u32 {
        self.session.rounds.len() as u32
    }

    pub(crate) fn collector(&self, round: Round, policy: QuorumPolicy) -> Collector {
        Collector::new(&self.session.id, round, policy).with_events(self.events.clone())
    }

    /// Close a dispatched round, store it, and decide whether the session
    /// proceeds. `annotate` sees the closed round only when it passed.
    pub(crate) fn settle<F>(
        &mut self,
        mut collector: Collector,
        end: RoundEnd,
        annotate: F,
    ) -> Result<(), FailureReason>
    where
        F: FnOnce(&mut Round),
    {
        let phase = collector.round().phase;
        let verdict = collector.verdict();
        let mut round = collector.close();

        let result = match (end, verdict) {
            (RoundEnd::Cancelled, _) => Err(FailureReason::Cancelled { phase }),
            (_, RoundVerdict::NoQuorum { responded, expected }) => Err(FailureReason::NoQuorum {
                phase,
                responded,
                expected,
            }),
            (_, RoundVerdict::FailureThresholdExceeded { failed, expected }) => {
                Err(FailureReason::FailureThresholdExceeded {
                    phase,
                    failed,
                    expected,
                })
            }
            (RoundEnd::Finished, RoundVerdict::Proceed) => Ok(()),
        };
        if result.is_ok() {
            annotate(&mut round);
        }

        info!(
            session_id = %self.session.id,
            round = round.index,
            phase = %phase,
            responded = round.responded(),
            expected = round.expected(),
            "Round closed"
        );
        self.session
            .record_round(round)
            .map_err(|e| FailureReason::from(&e))?;
        result
    }

    /// Close and store a workflow step round without a quorum verdict; the
    /// caller applies its own error handling to the returned copy. Only
    /// cancellation fails here.
    pub(crate) fn store(&mut self, mut collector: Collector, end: RoundEnd) -> Result<Round, FailureReason> {
        let phase = collector.round().phase;
        let round = collector.close();
        info!(
            session_id = %self.session.id,
            round = round.index,
            phase = %phase,
            responded = round.responded(),
            expected = round.expected(),
            "Step round closed"
        );
        self.session
            .record_round(round.clone())
            .map_err(|e| FailureReason::from(&e))?;
        match end {
            RoundEnd::Cancelled => Err(FailureReason::Cancelled { phase }),
            RoundEnd::Finished => Ok(round),
        }
    }

    /// Store the outcome and archive the session.
    pub(crate) fn conclude(&mut self, outcome: Outcome) -> Result<(), FailureReason> {
        let winner = outcome.winner.clone();
        let consensus = outcome.consensus;
        self.session
            .set_outcome(outcome)
            .map_err(|e| FailureReason::from(&e))?;
        info!(
            session_id = %self.session.id,
            winner = ?winner,
            consensus,
            "Outcome computed"
        );
        self.events.publish(CouncilEvent::OutcomeComputed {
            session_id: self.session.id.clone(),
            winner,
            consensus,
            timestamp: Utc::now(),
        });
        self.advance(SessionPhase::Archived, "outcome recorded")
    }

    /// Move the session to `error`. A session that is already terminal is left as is.
    pub(crate) fn halt(&mut self, reason: FailureReason) {
        let from = self.session.phase;
        if let Err(e) = self.session.fail(reason.clone()) {
            warn!(session_id = %self.session.id, error = %e, "Session already ended; failure not recorded");
            return;
        }
        error!(session_id = %self.session.id, phase = %from, reason = %reason, "Session failed");
        self.publish_phase(from, SessionPhase::Error, &reason.to_string());
        self.events.publish(CouncilEvent::SessionFailed {
            session_id: self.session.id.clone(),
            reason,
            timestamp: Utc::now(),
        });
    }

    pub(crate) fn finish(self) -> Session {
        self.session
    }

    fn publish_phase(&self, from: SessionPhase, to: SessionPhase, reason: &str) {
        self.events.publish(CouncilEvent::PhaseChanged {
            session_id: self.session.id.clone(),
            from,
            to,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
    }
}

/// Participant tally weights keyed by id.
pub(crate) fn weights_of(members: &[SessionMember]) -> HashMap<ParticipantId, f64> {
    members
        .iter()
        .map(|m| (m.id().to_string(), m.participant.weight))
        .collect()
}
