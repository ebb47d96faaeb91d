//! Session state machine — phases, transitions, and session tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::round::Round;
use crate::registry::ParticipantId;
use crate::tally::Outcome;

/// What a session is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Multi-round debate ending in a vote.
    Debate,
    /// Swarm assembly executing one task.
    Assembly,
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debate => write!(f, "debate"),
            Self::Assembly => write!(f, "assembly"),
        }
    }
}

/// Phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Participants being selected.
    Forming,
    /// One opening statement per participant, no cross-talk.
    Opening,
    /// Discussion rounds with access to earlier content.
    Debating,
    /// One ballot per participant.
    Voting,
    /// Swarm workers producing role outputs.
    Executing,
    /// Terminal tally running.
    Concluded,
    /// Finished with an outcome. Read-only.
    Archived,
    /// Finished without an outcome.
    Error,
}

impl SessionPhase {
    /// Whether this is a terminal phase.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Archived | Self::Error)
    }

    /// Whether turns are dispatched in this phase.
    pub fn dispatches_turns(self) -> bool {
        matches!(
            self,
            Self::Opening | Self::Debating | Self::Voting | Self::Executing
        )
    }

    /// Valid transitions from this phase for the given session kind.
    pub fn valid_transitions(self, kind: SessionKind) -> &'static [SessionPhase] {
        match (kind, self) {
            (SessionKind::Debate, Self::Forming) => &[Self::Opening, Self::Error],
            // Opening → Voting only when no discussion rounds are configured.
            (SessionKind::Debate, Self::Opening) => &[Self::Debating, Self::Voting, Self::Error],
            (SessionKind::Debate, Self::Debating) => &[Self::Voting, Self::Error],
            (SessionKind::Debate, Self::Voting) => &[Self::Concluded, Self::Error],
            (SessionKind::Assembly, Self::Forming) => &[Self::Executing, Self::Error],
            (SessionKind::Assembly, Self::Executing) => &[Self::Concluded, Self::Error],
            (_, Self::Concluded) => &[Self::Archived, Self::Error],
            _ => &[],
        }
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Forming => write!(f, "forming"),
            Self::Opening => write!(f, "opening"),
            Self::Debating => write!(f, "debating"),
            Self::Voting => write!(f, "voting"),
            Self::Executing => write!(f, "executing"),
            Self::Concluded => write!(f, "concluded"),
            Self::Archived => write!(f, "archived"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Why a session ended in [`SessionPhase::Error`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("insufficient pool: {available} participant(s) available")]
    InsufficientPool { available: usize },

    #[error("no quorum in {phase}: {responded}/{expected} responded")]
    NoQuorum {
        phase: SessionPhase,
        responded: usize,
        expected: usize,
    },

    #[error("failure threshold exceeded in {phase}: {failed}/{expected} turns failed or timed out")]
    FailureThresholdExceeded {
        phase: SessionPhase,
        failed: usize,
        expected: usize,
    },

    #[error("cancelled during {phase}")]
    Cancelled { phase: SessionPhase },

    #[error("invalid transition {from} → {to}")]
    InvalidTransition { from: SessionPhase, to: SessionPhase },

    #[error("no participant can fill role '{role}'")]
    RoleUnfilled { role: String },

    #[error("coordinator role '{role}' produced no output")]
    CoordinatorUnavailable { role: String },

    #[error("tally failed: {reason}")]
    TallyFailed { reason: String },

    #[error("workflow step {step} ({role}: {action}) did not complete")]
    StepFailed {
        step: usize,
        role: String,
        action: String,
    },
}

/// A phase transition record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub from: SessionPhase,
    pub to: SessionPhase,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Error for invalid state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: SessionPhase,
    pub to: SessionPhase,
    pub reason: String,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} → {}: {}",
            self.from, self.to, self.reason
        )
    }
}

impl std::error::Error for TransitionError {}

impl From<&TransitionError> for FailureReason {
    fn from(err: &TransitionError) -> Self {
        FailureReason::InvalidTransition {
            from: err.from,
            to: err.to,
        }
    }
}

/// One debate council or swarm assembly run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub kind: SessionKind,
    /// Topic title or task input.
    pub subject: String,
    /// Fixed at formation.
    pub participants: Vec<ParticipantId>,
    /// Hex-encoded selection seed.
    pub seed: String,
    pub phase: SessionPhase,
    /// Closed rounds, in order.
    pub rounds: Vec<Round>,
    pub transitions: Vec<Transition>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: Option<Outcome>,
    pub failure: Option<FailureReason>,
}

impl Session {
    /// Create a session in [`SessionPhase::Forming`].
    pub fn new(kind: SessionKind, subject: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            subject: subject.to_string(),
            participants: Vec::new(),
            seed: String::new(),
            phase: SessionPhase::Forming,
            rounds: Vec::new(),
            transitions: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            outcome: None,
            failure: None,
        }
    }

    /// Fix the participant list and seed. Allowed once, while forming.
    pub fn seat(
        &mut self,
        participants: Vec<ParticipantId>,
        seed: String,
    ) -> Result<(), TransitionError> {
        if self.phase != SessionPhase::Forming || !self.participants.is_empty() {
            return Err(TransitionError {
                from: self.phase,
                to: self.phase,
                reason: "participants are fixed after formation".to_string(),
            });
        }
        if participants.is_empty() {
            return Err(TransitionError {
                from: self.phase,
                to: self.phase,
                reason: "participant list is empty".to_string(),
            });
        }
        self.participants = participants;
        self.seed = seed;
        Ok(())
    }

    /// Transition to a new phase with a reason.
    pub fn transition(&mut self, to: SessionPhase, reason: &str) -> Result<(), TransitionError> {
        let allowed = self.phase.valid_transitions(self.kind);
        if !allowed.contains(&to) {
            return Err(TransitionError {
                from: self.phase,
                to,
                reason: format!("not a valid transition (allowed: {:?})", allowed),
            });
        }
        if self.phase == SessionPhase::Forming && to != SessionPhase::Error && self.participants.is_empty() {
            return Err(TransitionError {
                from: self.phase,
                to,
                reason: "session has no participants".to_string(),
            });
        }
        if to == SessionPhase::Archived && self.outcome.is_none() {
            return Err(TransitionError {
                from: self.phase,
                to,
                reason: "no outcome recorded".to_string(),
            });
        }

        self.transitions.push(Transition {
            from: self.phase,
            to,
            timestamp: Utc::now(),
            reason: reason.to_string(),
        });
        self.phase = to;
        if to.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Move to [`SessionPhase::Error`], recording why.
    pub fn fail(&mut self, reason: FailureReason) -> Result<(), TransitionError> {
        self.transition(SessionPhase::Error, &reason.to_string())?;
        self.failure = Some(reason);
        Ok(())
    }

    /// Append a closed round belonging to the current phase.
    pub fn record_round(&mut self, round: Round) -> Result<(), TransitionError> {
        if round.phase != self.phase || !round.is_closed() {
            return Err(TransitionError {
                from: self.phase,
                to: round.phase,
                reason: "round does not belong to the current phase or is still open".to_string(),
            });
        }
        self.rounds.push(round);
        Ok(())
    }

    /// Store the single outcome. Only the terminal tally calls this.
    pub fn set_outcome(&mut self, outcome: Outcome) -> Result<(), TransitionError> {
        if self.phase != SessionPhase::Concluded || self.outcome.is_some() {
            return Err(TransitionError {
                from: self.phase,
                to: SessionPhase::Archived,
                reason: "outcome can only be recorded once, while concluded".to_string(),
            });
        }
        self.outcome = Some(outcome);
        Ok(())
    }

    /// Whether the session has ended.
    pub fn is_complete(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Rounds recorded for a phase.
    pub fn rounds_in(&self, phase: SessionPhase) -> impl Iterator<Item = &Round> {
        self.rounds.iter().filter(move |r| r.phase == phase)
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64)
    }

    /// Compact status line.
    pub fn status_line(&self) -> String {
        format!(
            "[{}] {} {} | {} participants | {} rounds recorded",
            self.phase,
            self.kind,
            self.id,
            self.participants.len(),
            self.rounds.len()
        )
    }
}
