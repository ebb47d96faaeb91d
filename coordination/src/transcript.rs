//! Outcome/Transcript Builder and outcome sinks.
//!
//! A [`SessionRecord`] is the immutable value handed to persistence and
//! presentation once a session reaches a terminal phase.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::queue::Topic;
use crate::registry::{Participant, ParticipantId};
use crate::session::{
    FailureReason, Round, Session, SessionKind, SessionPhase, Transition, TurnContent, TurnStatus,
};
use crate::swarm::WorkflowReport;
use crate::tally::{Outcome, ValidationReport};

/// Longest response excerpt shown per turn in a transcript.
const EXCERPT_CHARS: usize = 200;

/// Finalized record of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub kind: SessionKind,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<Topic>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assembly: Option<String>,
    pub participants: Vec<Participant>,
    /// Role → participant for assemblies.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub roles: BTreeMap<String, ParticipantId>,
    pub seed: String,
    pub phase: SessionPhase,
    pub transitions: Vec<TransitionRecord>,
    pub rounds: Vec<Round>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
    /// Step results for assemblies that ran a workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowReport>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Serializable copy of a phase transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: SessionPhase,
    pub to: SessionPhase,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

impl From<&Transition> for TransitionRecord {
    fn from(t: &Transition) -> Self {
        Self {
            from: t.from,
            to: t.to,
            timestamp: t.timestamp,
            reason: t.reason.clone(),
        }
    }
}

impl SessionRecord {
    /// Build the record from a terminal session.
    pub fn from_session(session: Session, participants: Vec<Participant>) -> Self {
        let duration_ms = session.duration_ms();
        Self {
            transitions: session.transitions.iter().map(TransitionRecord::from).collect(),
            session_id: session.id,
            kind: session.kind,
            subject: session.subject,
            topic: None,
            assembly: None,
            participants,
            roles: BTreeMap::new(),
            seed: session.seed,
            phase: session.phase,
            rounds: session.rounds,
            outcome: session.outcome,
            failure: session.failure,
            validation: None,
            workflow: None,
            started_at: session.started_at,
            ended_at: session.ended_at,
            duration_ms,
        }
    }

    pub fn with_topic(mut self, topic: Topic) -> Self {
        self.topic = Some(topic);
        self
    }

    pub fn with_assembly(mut self, name: &str, roles: BTreeMap<String, ParticipantId>) -> Self {
        self.assembly = Some(name.to_string());
        self.roles = roles;
        self
    }

    pub fn with_validation(mut self, report: ValidationReport) -> Self {
        self.validation = Some(report);
        self
    }

    pub fn with_workflow(mut self, report: WorkflowReport) -> Self {
        self.workflow = Some(report);
        self
    }

    /// Whether the session finished with an outcome.
    pub fn succeeded(&self) -> bool {
        self.phase == SessionPhase::Archived && self.outcome.is_some()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Human-readable transcript.
    pub fn render_transcript(&self) -> String {
        let mut out = String::new();
        let title = match self.kind {
            SessionKind::Debate => "Debate Transcript",
            SessionKind::Assembly => "Assembly Transcript",
        };
        let _ = writeln!(out, "=== {}: {} ===", title, self.subject);
        let _ = writeln!(out, "Session: {} | phase: {} | seed: {}", self.session_id, self.phase, self.seed);
        if let Some(assembly) = &self.assembly {
            let _ = writeln!(out, "Assembly: {}", assembly);
        }
        let names: Vec<&str> = self.participants.iter().map(|p| p.id.as_str()).collect();
        let _ = writeln!(out, "Participants: {}", names.join(", "));
        for (role, participant) in &self.roles {
            let _ = writeln!(out, "  {} → {}", role, participant);
        }
        if let Some(ms) = self.duration_ms {
            let _ = writeln!(out, "Duration: {:.2}s", ms as f64 / 1000.0);
        }

        for round in &self.rounds {
            let _ = writeln!(out);
            let _ = writeln!(out, "--- Round {} ({}) ---", round.index, round.phase);
            for turn in &round.turns {
                let who = match &turn.role {
                    Some(role) => format!("{} as {}", turn.participant_id, role),
                    None => turn.participant_id.clone(),
                };
                match (&turn.status, &turn.content) {
                    (TurnStatus::Completed, Some(TurnContent::Response(r))) => {
                        let _ = writeln!(
                            out,
                            "[{}] {} (confidence {:.2})",
                            who,
                            excerpt(&r.content),
                            r.confidence
                        );
                    }
                    (TurnStatus::Completed, Some(TurnContent::Vote(v))) => {
                        let _ = writeln!(
                            out,
                            "[{}] votes {} (weight {:.2}): {}",
                            who,
                            v.option,
                            v.weight,
                            excerpt(&v.reasoning)
                        );
                    }
                    (TurnStatus::Completed, Some(TurnContent::Output(o))) => {
                        let _ = writeln!(
                            out,
                            "[{}] {} (confidence {:.2})",
                            who,
                            excerpt(&o.data.to_string()),
                            o.confidence
                        );
                    }
                    (status, _) => {
                        let reason = turn.error.as_deref().unwrap_or("no content");
                        let _ = writeln!(out, "[{}] {}: {}", who, status, reason);
                    }
                }
            }
            if let Some(summary) = &round.outcome {
                let _ = write!(out, "({}/{} responded", summary.responded, summary.expected);
                if let Some(estimate) = summary.consensus_estimate {
                    let _ = write!(out, ", consensus estimate {:.1}%", estimate * 100.0);
                }
                let _ = writeln!(out, ")");
            }
        }

        if let Some(workflow) = &self.workflow {
            let _ = writeln!(out);
            let _ = writeln!(
                out,
                "--- Workflow ({}, on error {:?}) ---",
                if workflow.parallel { "parallel" } else { "sequential" },
                workflow.error_handling
            );
            for step in &workflow.steps {
                let _ = writeln!(
                    out,
                    "{}. {}: {} by {} in round {} [{}]",
                    step.step, step.role, step.action, step.participant_id, step.round, step.status
                );
            }
        }

        let _ = writeln!(out);
        match (&self.outcome, &self.failure) {
            (Some(outcome), _) => {
                let _ = writeln!(out, "=== Outcome ===");
                if let Some(winner) = &outcome.winner {
                    let _ = writeln!(out, "Winner: {}", winner);
                }
                let _ = writeln!(out, "Consensus: {:.1}%", outcome.consensus * 100.0);
                if !outcome.distribution.is_empty() {
                    let _ = writeln!(out, "Distribution:");
                    for (key, weight) in &outcome.distribution {
                        let _ = writeln!(out, "  {}: {:.2}", key, weight);
                    }
                }
                if !outcome.conflicts.is_empty() {
                    let _ = writeln!(out, "Conflicts: {}", outcome.conflicts.len());
                }
                let _ = writeln!(out, "Summary: {}", outcome.summary);
            }
            (None, Some(failure)) => {
                let _ = writeln!(out, "=== Failed ===");
                let _ = writeln!(out, "{}", failure);
            }
            (None, None) => {
                let _ = writeln!(out, "=== No outcome ===");
            }
        }
        if let Some(report) = &self.validation {
            let _ = writeln!(
                out,
                "Validation: {} (quality {:.2})",
                if report.is_valid { "passed" } else { "failed" },
                report.quality_score
            );
            for error in &report.errors {
                let _ = writeln!(out, "  error: {}", error);
            }
            for warning in &report.warnings {
                let _ = writeln!(out, "  warning: {}", warning);
            }
        }
        out
    }
}

fn excerpt(text: &str) -> String {
    if text.chars().count() <= EXCERPT_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(EXCERPT_CHARS).collect();
    format!("{}…", cut)
}

/// Counts over a set of session records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub total: usize,
    /// Records whose session had not reached a terminal phase.
    pub active: usize,
    pub archived: usize,
    pub failed: usize,
    pub debates: usize,
    pub assemblies: usize,
}

impl SessionStats {
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a SessionRecord>,
    {
        let mut stats = Self::default();
        for record in records {
            stats.total += 1;
            match record.phase {
                SessionPhase::Archived => stats.archived += 1,
                SessionPhase::Error => stats.failed += 1,
                _ => stats.active += 1,
            }
            match record.kind {
                SessionKind::Debate => stats.debates += 1,
                SessionKind::Assembly => stats.assemblies += 1,
            }
        }
        stats
    }
}

/// Records whose session is still running.
pub fn active_sessions(records: &[SessionRecord]) -> Vec<&SessionRecord> {
    records.iter().filter(|r| !r.phase.is_terminal()).collect()
}

/// Error type for outcome sinks
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to write record: {0}")]
    Io(#[from] std::io::Error),
}

/// Receiver of finalized session records.
#[async_trait]
pub trait OutcomeSink: Send + Sync {
    async fn deliver(&self, record: &SessionRecord) -> Result<(), SinkError>;
}

/// Keeps records in memory.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<SessionRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<SessionRecord> {
        self.records.lock().await.clone()
    }

    pub async fn stats(&self) -> SessionStats {
        SessionStats::from_records(self.records.lock().await.iter())
    }
}

#[async_trait]
impl OutcomeSink for MemorySink {
    async fn deliver(&self, record: &SessionRecord) -> Result<(), SinkError> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}

/// Writes `<session_id>.json` into a directory.
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", session_id))
    }
}

#[async_trait]
impl OutcomeSink for JsonFileSink {
    async fn deliver(&self, record: &SessionRecord) -> Result<(), SinkError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&record.session_id);
        let json = record.to_json()?;
        tokio::fs::write(&path, json).await?;
        debug!(path = %path.display(), "Session record written");
        info!(session_id = %record.session_id, phase = %record.phase, "Session record delivered");
        Ok(())
    }
}
