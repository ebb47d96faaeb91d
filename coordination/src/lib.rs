//! Council Coordination Library
//!
//! Orchestration and consensus engine for multi-agent debate councils and
//! swarm assemblies:
//! - Capability registry with per-participant health bookkeeping
//! - Seeded, diversity-biased council selection
//! - Phased session state machine (debate and assembly paths)
//! - Turn scheduling with per-turn deadlines, in-flight bounds and cancellation
//! - Exactly-once turn collection with quorum and failure thresholds
//! - Weighted vote tally and multi-strategy result aggregation
//! - Task decomposition into dependency-levelled subtask batches
//!
//! # Engines
//!
//! ## Debate
//! [`DebateEngine::run`] forms a council for a [`Topic`], collects opening
//! statements, runs up to `max_rounds` discussion rounds (stopping early on
//! strong agreement), then tallies one weighted ballot per participant.
//!
//! ## Assembly
//! [`AssemblyEngine::run`] fills each role of an [`Assembly`] from the
//! registry, executes every worker concurrently, and aggregates the outputs
//! with the assembly's strategy (`majority`, `weighted-merge`, `best-of`,
//! `concatenation`, `voting`, `hierarchical`).
//!
//! Both return a [`SessionRecord`]; a session that fails ends in the `error`
//! phase with a [`FailureReason`] rather than an `Err`.
//!
//! # Usage
//!
//! ```no_run
//! use coordination::{
//!     CapabilityRegistry, DebateEngine, EngineConfig, Participant, ScriptedAgent, Topic,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), coordination::EngineError> {
//! let registry = CapabilityRegistry::new().shared();
//! for id in ["alpha", "beta", "gamma"] {
//!     let agent = ScriptedAgent::new(id).with_position("Support").shared();
//!     registry.register(Participant::new(id, ["policy"]), agent).await?;
//! }
//!
//! let engine = DebateEngine::new(registry, &EngineConfig::default())?;
//! let record = engine
//!     .run(Topic::new("t-1", "Adopt the proposal"), None, &CancellationToken::new())
//!     .await;
//! println!("{}", record.render_transcript());
//! # Ok(())
//! # }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod agent;
pub mod assembly;
pub mod collector;
pub mod config;
pub mod debate;
pub mod decompose;
pub mod error;
pub mod events;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod selection;
pub mod session;
pub mod swarm;
pub mod tally;
pub mod transcript;

// Re-export agent interface types
pub use agent::{
    Agent, AgentResponse, AgentVote, Ballot, PriorContribution, ProviderError, ResponseContext,
    ScriptedAgent, SharedAgent, WorkContext, WorkerOutput,
};

// Re-export registry types
pub use registry::{
    CapabilityRegistry, Participant, ParticipantHealth, ParticipantId, RegistryError,
    SessionMember, SharedCapabilityRegistry, TurnReport,
};

// Re-export selection types
pub use selection::{Candidate, Formation, SelectionConfig, SelectionError, Selector};

// Re-export session types
pub use session::{
    FailureReason, Round, RoundOutcome, Session, SessionKind, SessionPhase, Transition,
    TransitionError, Turn, TurnContent, TurnStatus,
};

// Re-export collection and scheduling types
pub use collector::{Arrival, ArrivalResult, Collector, Observation, QuorumPolicy, RoundVerdict};
pub use scheduler::{DiscussionMode, Dispatch, Invocation, RoundEnd, TurnScheduler};

// Re-export tally types
pub use tally::{
    aggregate, tally_votes, tally_weighted, validate_outcome, AggregationStrategy, Outcome,
    RoleOutput, SuccessCriteria, TallyError, UnknownStrategyError, ValidationReport,
};

// Re-export assembly types
pub use assembly::{
    Assembly, AssemblyError, AssemblyLoader, ErrorHandling, RoleDefinition, Workflow, WorkflowStep,
};

// Re-export decomposition types
pub use decompose::{
    critical_path, execution_order, Decomposition, DecomposeError, Dependency, DependencyKind,
    Subtask, TaskDecomposer, TaskKind, UnknownTaskKindError,
};

// Re-export engines
pub use debate::DebateEngine;
pub use swarm::{AssemblyEngine, StepResult, WorkflowReport};

// Re-export supply, transcript and event types
pub use events::{CouncilEvent, EventBus, EventFilter, SharedEventBus};
pub use queue::{RankedQueue, TaskSpec, Topic, WorkSource};
pub use transcript::{
    active_sessions, JsonFileSink, MemorySink, OutcomeSink, SessionRecord, SessionStats, SinkError,
};

// Re-export configuration and errors
pub use config::{ConfigError, DebatePolicy, EngineConfig, SwarmPolicy};
pub use error::{EngineError, EngineResult};
