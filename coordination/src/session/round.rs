//! Rounds and turns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::SessionPhase;
use crate::agent::{AgentResponse, AgentVote, WorkerOutput};
use crate::registry::ParticipantId;
use crate::tally::Outcome;

/// Status of a single turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Pending,
    Completed,
    TimedOut,
    Failed,
}

impl TurnStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Completed => write!(f, "completed"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// What a participant returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnContent {
    Response(AgentResponse),
    Vote(AgentVote),
    Output(WorkerOutput),
}

impl TurnContent {
    pub fn as_response(&self) -> Option<&AgentResponse> {
        match self {
            Self::Response(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_vote(&self) -> Option<&AgentVote> {
        match self {
            Self::Vote(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_output(&self) -> Option<&WorkerOutput> {
        match self {
            Self::Output(o) => Some(o),
            _ => None,
        }
    }
}

/// One participant's contribution within a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub participant_id: ParticipantId,
    /// Assigned swarm role, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub status: TurnStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<TurnContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration of the invocation.
    pub duration_ms: u64,
    /// When the collector accepted this turn's result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
}

impl Turn {
    pub fn pending(participant_id: &str) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            role: None,
            status: TurnStatus::Pending,
            content: None,
            error: None,
            duration_ms: 0,
            recorded_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == TurnStatus::Completed
    }
}

/// Summary attached to a round once it closes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RoundOutcome {
    pub expected: usize,
    pub responded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub quorum_met: bool,
    /// Running consensus estimate over stated positions (discussion rounds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_estimate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leading_position: Option<String>,
    /// Tally result of a decisive round.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
}

/// A phase-scoped batch of turns, one per participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub index: u32,
    pub phase: SessionPhase,
    pub turns: Vec<Turn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RoundOutcome>,
    pub opened_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl Round {
    /// Open a round with one pending turn per participant.
    pub fn open(index: u32, phase: SessionPhase, participants: &[ParticipantId]) -> Self {
        Self {
            index,
            phase,
            turns: participants.iter().map(|id| Turn::pending(id)).collect(),
            outcome: None,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    /// Open a round whose turns carry swarm role assignments.
    pub fn open_roles(index: u32, phase: SessionPhase, assignments: &[(ParticipantId, String)]) -> Self {
        let mut round = Self::open(index, phase, &[]);
        round.turns = assignments
            .iter()
            .map(|(id, role)| Turn {
                role: Some(role.clone()),
                ..Turn::pending(id)
            })
            .collect();
        round
    }

    pub fn turn(&self, participant_id: &str) -> Option<&Turn> {
        self.turns.iter().find(|t| t.participant_id == participant_id)
    }

    pub fn turn_mut(&mut self, participant_id: &str) -> Option<&mut Turn> {
        self.turns
            .iter_mut()
            .find(|t| t.participant_id == participant_id)
    }

    pub fn expected(&self) -> usize {
        self.turns.len()
    }

    pub fn count(&self, status: TurnStatus) -> usize {
        self.turns.iter().filter(|t| t.status == status).count()
    }

    pub fn responded(&self) -> usize {
        self.count(TurnStatus::Completed)
    }

    pub fn pending(&self) -> usize {
        self.count(TurnStatus::Pending)
    }

    /// Failed plus timed-out turns.
    pub fn unsuccessful(&self) -> usize {
        self.count(TurnStatus::Failed) + self.count(TurnStatus::TimedOut)
    }

    pub fn completed_turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter().filter(|t| t.is_completed())
    }

    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }

    pub fn close(&mut self) {
        if self.closed_at.is_none() {
            self.closed_at = Some(Utc::now());
        }
    }

    /// Counts for the round outcome; estimate and tally are filled in by the caller.
    pub fn summarize(&self, quorum_met: bool) -> RoundOutcome {
        RoundOutcome {
            expected: self.expected(),
            responded: self.responded(),
            failed: self.count(TurnStatus::Failed),
            timed_out: self.count(TurnStatus::TimedOut),
            quorum_met,
            ..RoundOutcome::default()
        }
    }
}
