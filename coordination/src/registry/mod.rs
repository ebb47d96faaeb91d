//! Capability Registry — participants, their capability tags and health
//!
//! Tracks which agents/workers are available, the capability tags they
//! declare, their tally weight, and live health metadata (latency, error and
//! timeout counts). Read-mostly: lookups take a shared lock, registration and
//! removal take the exclusive one.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::agent::SharedAgent;

/// Unique identifier for a participant.
pub type ParticipantId = String;

/// Shared reference to a registry.
pub type SharedCapabilityRegistry = Arc<CapabilityRegistry>;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("Participant id must not be empty")]
    EmptyId,

    #[error("Invalid weight {weight} for participant {id}: must be finite and >= 0")]
    InvalidWeight { id: ParticipantId, weight: f64 },

    #[error("Participant already registered: {0}")]
    Duplicate(ParticipantId),

    #[error("Participant not found: {0}")]
    NotFound(ParticipantId),
}

/// A participant as declared at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    /// Ordered, unique capability tags.
    pub capabilities: Vec<String>,
    /// Tally weight (>= 0).
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl Participant {
    /// Create a participant; duplicate tags are dropped, first occurrence wins.
    pub fn new<I, S>(id: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = BTreeSet::new();
        let capabilities = capabilities
            .into_iter()
            .map(Into::into)
            .filter(|tag: &String| seen.insert(tag.clone()))
            .collect();
        Self {
            id: id.into(),
            capabilities,
            weight: default_weight(),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.iter().any(|c| c == tag)
    }

    pub fn has_all(&self, tags: &[String]) -> bool {
        tags.iter().all(|t| self.has_capability(t))
    }

    /// Number of `tags` this participant declares.
    pub fn overlap(&self, tags: &[String]) -> usize {
        tags.iter().filter(|t| self.has_capability(t)).count()
    }

    /// Jaccard similarity of the two capability sets. Two empty sets are identical.
    pub fn jaccard(&self, other: &Participant) -> f64 {
        let a: BTreeSet<&str> = self.capabilities.iter().map(String::as_str).collect();
        let b: BTreeSet<&str> = other.capabilities.iter().map(String::as_str).collect();
        let union = a.union(&b).count();
        if union == 0 {
            return 1.0;
        }
        a.intersection(&b).count() as f64 / union as f64
    }

    fn validate(&self) -> Result<(), RegistryError> {
        if self.id.trim().is_empty() {
            return Err(RegistryError::EmptyId);
        }
        if !self.weight.is_finite() || self.weight < 0.0 {
            return Err(RegistryError::InvalidWeight {
                id: self.id.clone(),
                weight: self.weight,
            });
        }
        Ok(())
    }
}

/// Live health metadata for a participant
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticipantHealth {
    /// Mean latency of completed turns in milliseconds
    pub avg_latency_ms: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub timeout_count: u64,
    pub last_seen: Option<DateTime<Utc>>,
}

impl ParticipantHealth {
    /// Compute success rate (0.0 - 1.0)
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.error_count + self.timeout_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    /// Record a completed turn with latency
    pub fn record_success(&mut self, latency_ms: u64) {
        self.avg_latency_ms =
            (self.avg_latency_ms * self.success_count + latency_ms) / (self.success_count + 1);
        self.success_count += 1;
        self.last_seen = Some(Utc::now());
    }

    pub fn record_failure(&mut self) {
        self.error_count += 1;
        self.last_seen = Some(Utc::now());
    }

    pub fn record_timeout(&mut self) {
        self.timeout_count += 1;
        self.last_seen = Some(Utc::now());
    }
}

/// How a finished turn went, for health bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnReport {
    Completed { latency_ms: u64 },
    Failed,
    TimedOut,
}

/// A participant paired with the agent that speaks for it.
#[derive(Clone)]
pub struct SessionMember {
    pub participant: Participant,
    pub agent: SharedAgent,
}

impl SessionMember {
    pub fn new(participant: Participant, agent: SharedAgent) -> Self {
        Self { participant, agent }
    }

    pub fn id(&self) -> &str {
        &self.participant.id
    }
}

impl std::fmt::Debug for SessionMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMember")
            .field("participant", &self.participant)
            .finish_non_exhaustive()
    }
}

struct RegistryEntry {
    member: SessionMember,
    health: ParticipantHealth,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<ParticipantId, RegistryEntry>,
    /// Registration order.
    order: Vec<ParticipantId>,
}

impl RegistryInner {
    fn apply(&mut self, id: &str, report: TurnReport) {
        let Some(entry) = self.entries.get_mut(id) else {
            debug!(participant = %id, "Health report for unregistered participant dropped");
            return;
        };
        match report {
            TurnReport::Completed { latency_ms } => entry.health.record_success(latency_ms),
            TurnReport::Failed => entry.health.record_failure(),
            TurnReport::TimedOut => entry.health.record_timeout(),
        }
    }
}

/// Registry of all known participants with their capabilities and health
#[derive(Default)]
pub struct CapabilityRegistry {
    inner: RwLock<RegistryInner>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared reference to this registry
    pub fn shared(self) -> SharedCapabilityRegistry {
        Arc::new(self)
    }

    /// Register a participant together with the agent that speaks for it.
    pub async fn register(
        &self,
        participant: Participant,
        agent: SharedAgent,
    ) -> Result<(), RegistryError> {
        participant.validate()?;
        let mut inner = self.inner.write().await;
        if inner.entries.contains_key(&participant.id) {
            return Err(RegistryError::Duplicate(participant.id));
        }

        let id = participant.id.clone();
        info!(participant = %id, capabilities = ?participant.capabilities, "Participant registered");
        inner.order.push(id.clone());
        inner.entries.insert(
            id,
            RegistryEntry {
                member: SessionMember::new(participant, agent),
                health: ParticipantHealth::default(),
            },
        );
        Ok(())
    }

    /// Remove a participant. Sessions already formed keep their own member snapshot.
    pub async fn remove(&self, id: &str) -> Result<Participant, RegistryError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        inner.order.retain(|p| p != id);
        info!(participant = %id, "Participant removed");
        Ok(entry.member.participant)
    }

    pub async fn get(&self, id: &str) -> Option<Participant> {
        let inner = self.inner.read().await;
        inner.entries.get(id).map(|e| e.member.participant.clone())
    }

    pub async fn health(&self, id: &str) -> Option<ParticipantHealth> {
        let inner = self.inner.read().await;
        inner.entries.get(id).map(|e| e.health.clone())
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of every member in registration order.
    pub async fn snapshot(&self) -> Vec<SessionMember> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .map(|e| e.member.clone())
            .collect()
    }

    /// Members declaring every one of `tags`.
    pub async fn with_capabilities(&self, tags: &[String]) -> Vec<SessionMember> {
        self.snapshot()
            .await
            .into_iter()
            .filter(|m| m.participant.has_all(tags))
            .collect()
    }

    /// Update health for a participant; unknown ids are ignored.
    pub async fn record(&self, id: &str, report: TurnReport) {
        let mut inner = self.inner.write().await;
        inner.apply(id, report);
    }

    /// Apply a round's worth of health reports under one write lock.
    pub async fn record_batch(&self, reports: Vec<(ParticipantId, TurnReport)>) {
        if reports.is_empty() {
            return;
        }
        let mut inner = self.inner.write().await;
        for (id, report) in reports {
            inner.apply(&id, report);
        }
    }

    /// Hold the write lock until `release` fires.
    #[cfg(test)]
    pub(crate) async fn hold_exclusive(
        &self,
        locked: tokio::sync::oneshot::Sender<()>,
        release: tokio::sync::oneshot::Receiver<()>,
    ) {
        let _guard = self.inner.write().await;
        let _ = locked.send(());
        let _ = release.await;
    }

    /// Participant ids ordered by success rate (best first), then latency.
    pub async fn ranked_by_health(&self) -> Vec<ParticipantId> {
        let inner = self.inner.read().await;
        let mut entries: Vec<&RegistryEntry> = inner.entries.values().collect();
        entries.sort_by(|a, b| {
            b.health
                .success_rate()
                .partial_cmp(&a.health.success_rate())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.health.avg_latency_ms.cmp(&b.health.avg_latency_ms))
                .then_with(|| a.member.participant.id.cmp(&b.member.participant.id))
        });
        entries
            .into_iter()
            .map(|e| e.member.participant.id.clone())
            .collect()
    }
}
