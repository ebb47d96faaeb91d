//! Event types for council coordination
//!
//! Published on every phase transition, recorded turn, discarded arrival,
//! closed round and final outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::ParticipantId;
use crate::session::{FailureReason, SessionKind, SessionPhase, TurnStatus};

/// Unique identifier for events
pub type EventId = String;

/// All council coordination events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CouncilEvent {
    /// Participants were seated
    SessionFormed {
        session_id: String,
        kind: SessionKind,
        participants: Vec<ParticipantId>,
        seed: String,
        timestamp: DateTime<Utc>,
    },

    /// The session moved to a new phase
    PhaseChanged {
        session_id: String,
        from: SessionPhase,
        to: SessionPhase,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A turn reached a terminal status
    TurnRecorded {
        session_id: String,
        round: u32,
        participant_id: ParticipantId,
        status: TurnStatus,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A duplicate or late arrival was dropped
    ArrivalDiscarded {
        session_id: String,
        round: u32,
        participant_id: ParticipantId,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A round closed
    RoundClosed {
        session_id: String,
        round: u32,
        phase: SessionPhase,
        responded: usize,
        expected: usize,
        timestamp: DateTime<Utc>,
    },

    /// The terminal tally produced an outcome
    OutcomeComputed {
        session_id: String,
        winner: Option<String>,
        consensus: f64,
        timestamp: DateTime<Utc>,
    },

    /// The session ended in error
    SessionFailed {
        session_id: String,
        reason: FailureReason,
        timestamp: DateTime<Utc>,
    },
}

impl CouncilEvent {
    /// Get the timestamp of this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::SessionFormed { timestamp, .. }
            | Self::PhaseChanged { timestamp, .. }
            | Self::TurnRecorded { timestamp, .. }
            | Self::ArrivalDiscarded { timestamp, .. }
            | Self::RoundClosed { timestamp, .. }
            | Self::OutcomeComputed { timestamp, .. }
            | Self::SessionFailed { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionFormed { .. } => "session_formed",
            Self::PhaseChanged { .. } => "phase_changed",
            Self::TurnRecorded { .. } => "turn_recorded",
            Self::ArrivalDiscarded { .. } => "arrival_discarded",
            Self::RoundClosed { .. } => "round_closed",
            Self::OutcomeComputed { .. } => "outcome_computed",
            Self::SessionFailed { .. } => "session_failed",
        }
    }

    /// Session the event belongs to
    pub fn session_id(&self) -> &str {
        match self {
            Self::SessionFormed { session_id, .. }
            | Self::PhaseChanged { session_id, .. }
            | Self::TurnRecorded { session_id, .. }
            | Self::ArrivalDiscarded { session_id, .. }
            | Self::RoundClosed { session_id, .. }
            | Self::OutcomeComputed { session_id, .. }
            | Self::SessionFailed { session_id, .. } => session_id,
        }
    }

    /// Generate a new unique event ID
    pub fn new_id() -> EventId {
        uuid::Uuid::new_v4().to_string()
    }
}
