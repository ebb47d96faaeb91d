//! Agent rosters: YAML files describing the scripted agents a CLI run seats.
//!
//! ```yaml
//! agents:
//!   - id: alpha
//!     capabilities: [reasoning, critique]
//!     position: A
//!     vote: A
//!   - id: beta
//!     capabilities: [synthesis]
//!     output: { answer: 2 }
//!     confidence: 0.9
//!     delay_ms: 250
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use coordination::{CapabilityRegistry, Participant, ProviderError, ScriptedAgent};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Roster {
    pub agents: Vec<RosterEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RosterEntry {
    pub id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub statement: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub vote: Option<String>,
    #[serde(default = "default_weight")]
    pub vote_weight: f64,
    /// Payload returned for swarm roles.
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub delay_ms: u64,
    /// When set, every invocation fails as unavailable with this message.
    #[serde(default)]
    pub fail: Option<String>,
}

fn default_weight() -> f64 {
    1.0
}

impl RosterEntry {
    pub fn participant(&self) -> Participant {
        Participant::new(&self.id, self.capabilities.iter().cloned()).with_weight(self.weight)
    }

    pub fn agent(&self) -> ScriptedAgent {
        let mut agent = ScriptedAgent::new(&self.id);
        if let Some(statement) = &self.statement {
            agent = agent.with_statement(statement);
        }
        if let Some(confidence) = self.confidence {
            agent = agent.with_confidence(confidence);
        }
        if let Some(position) = &self.position {
            agent = agent.with_position(position);
        }
        if let Some(vote) = &self.vote {
            agent = agent.voting(vote, self.vote_weight);
        }
        if let Some(output) = &self.output {
            agent = agent.with_output(output.clone());
        }
        if self.delay_ms > 0 {
            agent = agent.with_delay(Duration::from_millis(self.delay_ms));
        }
        if let Some(message) = &self.fail {
            agent = agent.failing(ProviderError::unavailable(message));
        }
        agent
    }
}

impl Roster {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let roster: Self = serde_yaml::from_str(yaml).context("invalid roster document")?;
        Ok(roster)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read roster {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Register every entry, in file order.
    pub async fn register(&self, registry: &CapabilityRegistry) -> Result<()> {
        for entry in &self.agents {
            registry
                .register(entry.participant(), entry.agent().shared())
                .await
                .with_context(|| format!("failed to register agent '{}'", entry.id))?;
        }
        Ok(())
    }
}
