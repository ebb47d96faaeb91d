//! Agent interface: the narrow boundary to response generation.
//!
//! The engine never talks to a language model directly. Every participant is
//! reached through the [`Agent`] trait: "produce one response given a context",
//! "produce one vote given options", and (for swarm workers) "produce one role
//! output for a task". Failures come back as a [`ProviderError`] and are
//! absorbed into the Turn that invoked them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::Topic;
use crate::registry::ParticipantId;
use crate::session::SessionPhase;

/// Failure kinds a provider can report.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderError {
    #[error("provider timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("provider quota exhausted: {message}")]
    Quota { message: String },

    #[error("malformed provider output: {reason}")]
    MalformedOutput { reason: String },

    #[error("provider unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("provider error: {message}")]
    Other { message: String },
}

impl ProviderError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedOutput {
            reason: reason.into(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}

/// A single free-text contribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub content: String,
    /// Self-reported confidence (0.0–1.0).
    pub confidence: f64,
    /// Option the agent currently leans towards, if it states one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A single ballot cast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentVote {
    pub option: String,
    pub weight: f64,
    pub reasoning: String,
}

/// Output of a swarm worker for its assigned role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub data: serde_json::Value,
    pub confidence: f64,
    pub produced_at: DateTime<Utc>,
}

/// Content from an earlier turn, handed to the next speaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorContribution {
    pub participant_id: ParticipantId,
    pub round_index: u32,
    pub phase: SessionPhase,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
}

/// Everything an agent sees when asked to speak.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseContext {
    pub session_id: String,
    pub topic: Topic,
    pub phase: SessionPhase,
    pub round_index: u32,
    /// Earlier rounds first, then earlier speakers of this round.
    pub prior: Vec<PriorContribution>,
}

/// Number of prior contributions quoted in a prompt.
const PROMPT_HISTORY: usize = 3;

impl ResponseContext {
    /// Render the prompt text handed to a language-model backed agent.
    pub fn prompt(&self) -> String {
        let mut prompt = match self.phase {
            SessionPhase::Opening => {
                format!("Provide your opening statement on: {}", self.topic.title)
            }
            _ => format!(
                "Round {} - Continue the discussion on: {}",
                self.round_index, self.topic.title
            ),
        };

        if !self.prior.is_empty() {
            prompt.push_str("\n\nPrevious points made:\n");
            let skip = self.prior.len().saturating_sub(PROMPT_HISTORY);
            for entry in self.prior.iter().skip(skip) {
                let preview: String = entry.content.chars().take(100).collect();
                prompt.push_str(&format!("- {}: {}\n", entry.participant_id, preview));
            }
        }

        prompt
    }
}

/// The options a voter chooses between.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ballot {
    pub session_id: String,
    pub topic: Topic,
    pub options: Vec<String>,
}

impl Ballot {
    pub fn contains(&self, option: &str) -> bool {
        self.options.iter().any(|o| o == option)
    }
}

/// Work handed to a swarm worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkContext {
    pub session_id: String,
    pub assembly: String,
    pub role: String,
    pub responsibilities: Vec<String>,
    pub input: String,
    /// Workflow step action, when the assembly runs a workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

/// A participant the engine can invoke.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Identifier matching the participant's registry entry.
    fn id(&self) -> &str;

    /// Produce one response for a debate turn.
    async fn respond(&self, context: &ResponseContext) -> Result<AgentResponse, ProviderError>;

    /// Cast one vote from the ballot's options.
    async fn vote(&self, ballot: &Ballot) -> Result<AgentVote, ProviderError>;

    /// Produce the output for an assigned swarm role.
    ///
    /// Agents that only speak free text get their response wrapped as a JSON
    /// string payload.
    async fn execute(&self, work: &WorkContext) -> Result<WorkerOutput, ProviderError> {
        let topic = Topic::new(&work.session_id, &work.input);
        let context = ResponseContext {
            session_id: work.session_id.clone(),
            topic,
            phase: SessionPhase::Executing,
            round_index: 0,
            prior: Vec::new(),
        };
        let response = self.respond(&context).await?;
        Ok(WorkerOutput {
            data: serde_json::Value::String(response.content),
            confidence: response.confidence,
            produced_at: response.timestamp,
        })
    }
}

/// Shared handle to an agent implementation.
pub type SharedAgent = Arc<dyn Agent>;

/// Deterministic in-process agent with a fixed script.
///
/// Used by the CLI roster and by tests; no network, no model.
#[derive(Debug, Clone)]
pub struct ScriptedAgent {
    id: String,
    statement: String,
    confidence: f64,
    position: Option<String>,
    vote_option: Option<String>,
    vote_weight: f64,
    output: Option<serde_json::Value>,
    respond_delay: Duration,
    vote_delay: Duration,
    failure: Option<ProviderError>,
}

impl ScriptedAgent {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            statement: format!("{} has no further remarks", id),
            id,
            confidence: 0.8,
            position: None,
            vote_option: None,
            vote_weight: 1.0,
            output: None,
            respond_delay: Duration::ZERO,
            vote_delay: Duration::ZERO,
            failure: None,
        }
    }

    pub fn with_statement(mut self, statement: impl Into<String>) -> Self {
        self.statement = statement.into();
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_position(mut self, position: impl Into<String>) -> Self {
        self.position = Some(position.into());
        self
    }

    /// Vote for `option` with the given ballot weight.
    pub fn voting(mut self, option: impl Into<String>, weight: f64) -> Self {
        self.vote_option = Some(option.into());
        self.vote_weight = weight;
        self
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    /// Delay every invocation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.respond_delay = delay;
        self.vote_delay = delay;
        self
    }

    /// Delay only ballots.
    pub fn with_vote_delay(mut self, delay: Duration) -> Self {
        self.vote_delay = delay;
        self
    }

    pub fn failing(mut self, error: ProviderError) -> Self {
        self.failure = Some(error);
        self
    }

    pub fn shared(self) -> SharedAgent {
        Arc::new(self)
    }

    async fn pause(delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn check_failure(&self) -> Result<(), ProviderError> {
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn respond(&self, context: &ResponseContext) -> Result<AgentResponse, ProviderError> {
        Self::pause(self.respond_delay).await;
        self.check_failure()?;
        Ok(AgentResponse {
            content: format!("[{} r{}] {}", context.phase, context.round_index, self.statement),
            confidence: self.confidence,
            position: self.position.clone(),
            timestamp: Utc::now(),
        })
    }

    async fn vote(&self, ballot: &Ballot) -> Result<AgentVote, ProviderError> {
        Self::pause(self.vote_delay).await;
        self.check_failure()?;
        let option = self
            .vote_option
            .clone()
            .or_else(|| self.position.clone())
            .or_else(|| ballot.options.first().cloned())
            .ok_or_else(|| ProviderError::malformed("ballot has no options"))?;
        Ok(AgentVote {
            option,
            weight: self.vote_weight,
            reasoning: self.statement.clone(),
        })
    }

    async fn execute(&self, _work: &WorkContext) -> Result<WorkerOutput, ProviderError> {
        Self::pause(self.respond_delay).await;
        self.check_failure()?;
        let data = self
            .output
            .clone()
            .unwrap_or_else(|| serde_json::Value::String(self.statement.clone()));
        Ok(WorkerOutput {
            data,
            confidence: self.confidence,
            produced_at: Utc::now(),
        })
    }
}
