//! Assembly engine: runs one task through a swarm assembly.
//!
//! Roles are filled from the registry, every assigned worker executes
//! concurrently under the in-flight bound, and the completed role outputs are
//! aggregated with the assembly's strategy. An assembly with a workflow runs
//! its steps instead, one round per dispatch wave, and stops or continues on
//! a failed step as the workflow says.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{ProviderError, WorkContext};
use crate::assembly::{assign_roles, Assembly, AssemblyError, AssemblyLoader, ErrorHandling, Workflow};
use crate::collector::QuorumPolicy;
use crate::config::{EngineConfig, SwarmPolicy};
use crate::error::EngineError;
use crate::events::{EventBus, SharedEventBus};
use crate::queue::{TaskSpec, WorkSource};
use crate::registry::{ParticipantId, SessionMember, SharedCapabilityRegistry};
use crate::scheduler::{Dispatch, Invocation, TurnScheduler};
use crate::selection::{fresh_seed, rng_from_seed};
use crate::session::driver::SessionDriver;
use crate::session::{FailureReason, Round, SessionKind, SessionPhase, TurnContent, TurnStatus};
use crate::tally::{
    aggregate, validate_outcome, AggregationContext, RoleOutput, TallyError, ValidationReport,
};
use crate::transcript::SessionRecord;

/// Runs swarm assemblies over participants drawn from a registry.
pub struct AssemblyEngine {
    registry: SharedCapabilityRegistry,
    policy: SwarmPolicy,
    events: SharedEventBus,
}

impl AssemblyEngine {
    pub fn new(registry: SharedCapabilityRegistry, config: &EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            registry,
            policy: config.swarm.clone(),
            events: EventBus::new().shared(),
        })
    }

    pub fn with_events(mut self, events: SharedEventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &SharedEventBus {
        &self.events
    }

    pub fn policy(&self) -> &SwarmPolicy {
        &self.policy
    }

    /// Dequeue the next task and run it with the assembly it names.
    ///
    /// Returns `None` once the source is drained.
    pub async fn run_next<S>(
        &self,
        assemblies: &AssemblyLoader,
        source: &S,
        cancel: &CancellationToken,
    ) -> Option<Result<SessionRecord, EngineError>>
    where
        S: WorkSource<TaskSpec> + ?Sized,
    {
        let task = source.next().await?;
        let result = match assemblies.get(&task.assembly) {
            Ok(assembly) => Ok(self.run(assembly, &task.input, None, cancel).await),
            Err(e) => {
                warn!(task = %task.id, assembly = %task.assembly, "Task names an unknown assembly");
                Err(e.into())
            }
        };
        Some(result)
    }

    /// Run one task to a terminal phase.
    pub async fn run(
        &self,
        assembly: &Assembly,
        input: &str,
        seed: Option<&[u8]>,
        cancel: &CancellationToken,
    ) -> SessionRecord {
        let mut driver = SessionDriver::new(SessionKind::Assembly, input, self.events.clone());
        info!(
            session_id = %driver.id(),
            assembly = %assembly.name,
            strategy = %assembly.strategy,
            workflow = assembly.workflow.is_some(),
            "Assembly started"
        );

        let mut state = RunState {
            assigned: Vec::new(),
            workflow: assembly.workflow.as_ref().map(WorkflowReport::for_workflow),
        };
        let validation = match self
            .drive(&mut driver, assembly, input, seed, cancel, &mut state)
            .await
        {
            Ok(report) => Some(report),
            Err(reason) => {
                driver.halt(reason);
                None
            }
        };

        let session = driver.finish();
        info!(
            session_id = %session.id,
            assembly = %assembly.name,
            phase = %session.phase,
            "Assembly finished"
        );
        let roles: BTreeMap<String, ParticipantId> = state
            .assigned
            .iter()
            .map(|(role, member)| (role.clone(), member.id().to_string()))
            .collect();
        let participants = state.assigned.into_iter().map(|(_, m)| m.participant).collect();
        let mut record = SessionRecord::from_session(session, participants).with_assembly(&assembly.name, roles);
        if let Some(report) = state.workflow {
            record = record.with_workflow(report);
        }
        match validation {
            Some(report) => record.with_validation(report),
            None => record,
        }
    }

    async fn drive(
        &self,
        driver: &mut SessionDriver,
        assembly: &Assembly,
        input: &str,
        seed: Option<&[u8]>,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> Result<ValidationReport, FailureReason> {
        // Forming
        driver.check_cancelled(cancel)?;
        let pool = self.registry.snapshot().await;
        if pool.is_empty() {
            return Err(FailureReason::InsufficientPool { available: 0 });
        }
        let seed = seed.map(<[u8]>::to_vec).unwrap_or_else(fresh_seed);
        let mut rng = rng_from_seed(&seed);
        state.assigned = assign_roles(&assembly.roles, &pool, &mut rng).map_err(|e| match e {
            AssemblyError::RoleUnfilled(role) => FailureReason::RoleUnfilled { role },
            other => {
                warn!(session_id = %driver.id(), error = %other, "Role assignment failed");
                FailureReason::InsufficientPool {
                    available: pool.len(),
                }
            }
        })?;
        let assigned = &state.assigned;
        driver.seat(
            assigned.iter().map(|(_, m)| m.id().to_string()).collect(),
            hex::encode(&seed),
        )?;

        // Executing
        driver.advance(SessionPhase::Executing, "roles assigned")?;
        let scheduler = TurnScheduler::new(assembly.turn_timeout().unwrap_or_else(|| self.policy.turn_timeout()))
            .with_max_in_flight(assembly.max_in_flight.or(self.policy.max_in_flight))
            .with_registry(self.registry.clone());

        let members: Vec<SessionMember> = assigned.iter().map(|(_, m)| m.clone()).collect();
        let weights: HashMap<&str, f64> = members
            .iter()
            .map(|m| (m.id(), m.participant.weight))
            .collect();
        let work: HashMap<ParticipantId, WorkContext> = assigned
            .iter()
            .map(|(role, m)| {
                let responsibilities = assembly
                    .role(role)
                    .map(|r| r.responsibilities.clone())
                    .unwrap_or_default();
                let context = WorkContext {
                    session_id: driver.id().to_string(),
                    assembly: assembly.name.clone(),
                    role: role.clone(),
                    responsibilities,
                    input: input.to_string(),
                    action: None,
                };
                (m.id().to_string(), context)
            })
            .collect();

        let (result, responded, expected) = match (&assembly.workflow, state.workflow.as_mut()) {
            (Some(workflow), Some(report)) => {
                let run = WorkflowRun {
                    workflow,
                    by_role: assigned.iter().map(|(role, m)| (role.as_str(), m)).collect(),
                    work: &work,
                    scheduler: &scheduler,
                    weights: &weights,
                    policy: self.policy.quorum_policy(),
                };
                let outputs = run.execute(driver, cancel, report).await?;
                driver.advance(SessionPhase::Concluded, "workflow steps finished")?;
                let context = AggregationContext {
                    expected: workflow.steps.len(),
                    coordinator_role: assembly.coordinator_role.clone(),
                };
                (
                    aggregate(assembly.strategy, &outputs, &context),
                    report.completed(),
                    workflow.steps.len(),
                )
            }
            _ => {
                let slots: Vec<(ParticipantId, String)> = assigned
                    .iter()
                    .map(|(role, m)| (m.id().to_string(), role.clone()))
                    .collect();
                let round = Round::open_roles(driver.next_round_index(), SessionPhase::Executing, &slots);
                let mut collector = driver.collector(round, self.policy.quorum_policy());
                let end = scheduler
                    .run_round(&mut collector, &members, Dispatch::Concurrent, invoke_with(&work), cancel)
                    .await;

                let context = AggregationContext {
                    expected: members.len(),
                    coordinator_role: assembly.coordinator_role.clone(),
                };
                let mut aggregated = None;
                driver.settle(collector, end, |round| {
                    let outputs = role_outputs(round, &weights);
                    let result = aggregate(assembly.strategy, &outputs, &context);
                    if let (Some(summary), Ok(outcome)) = (round.outcome.as_mut(), &result) {
                        summary.outcome = Some(outcome.clone());
                    }
                    aggregated = Some((result, round.responded(), round.expected()));
                })?;

                // Concluded
                driver.advance(SessionPhase::Concluded, "role outputs collected")?;
                aggregated.ok_or(FailureReason::NoQuorum {
                    phase: SessionPhase::Concluded,
                    responded: 0,
                    expected: members.len(),
                })?
            }
        };

        match result {
            Ok(outcome) => {
                let report = validate_outcome(&outcome, &assembly.success_criteria);
                if !report.is_valid {
                    warn!(
                        session_id = %driver.id(),
                        errors = ?report.errors,
                        "Outcome does not meet the assembly's success criteria"
                    );
                }
                driver.conclude(outcome)?;
                Ok(report)
            }
            Err(TallyError::CoordinatorUnavailable(role)) => {
                Err(FailureReason::CoordinatorUnavailable { role })
            }
            Err(TallyError::MissingCoordinatorRole) => Err(FailureReason::CoordinatorUnavailable {
                role: assembly.coordinator_role.clone().unwrap_or_default(),
            }),
            Err(TallyError::NoQuorum { .. }) => Err(FailureReason::NoQuorum {
                phase: SessionPhase::Concluded,
                responded,
                expected,
            }),
            Err(e @ TallyError::NonFiniteTotal { .. }) => Err(FailureReason::TallyFailed {
                reason: e.to_string(),
            }),
        }
    }
}

/// What a run learned before it ended, kept even when it fails.
struct RunState {
    assigned: Vec<(String, SessionMember)>,
    workflow: Option<WorkflowReport>,
}

/// How one workflow step went.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step: usize,
    pub role: String,
    pub action: String,
    pub participant_id: ParticipantId,
    /// Round the step was dispatched in.
    pub round: u32,
    pub status: TurnStatus,
}

/// Per-step account of a workflow run, in step order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub parallel: bool,
    pub error_handling: ErrorHandling,
    pub steps: Vec<StepResult>,
}

impl WorkflowReport {
    fn for_workflow(workflow: &Workflow) -> Self {
        Self {
            parallel: workflow.parallel,
            error_handling: workflow.error_handling,
            steps: Vec::new(),
        }
    }

    pub fn completed(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == TurnStatus::Completed)
            .count()
    }

    /// Steps that failed or timed out.
    pub fn failed(&self) -> impl Iterator<Item = &StepResult> {
        self.steps.iter().filter(|s| s.status != TurnStatus::Completed)
    }
}

/// Runs an assembly's workflow steps wave by wave, one round per wave.
struct WorkflowRun<'a> {
    workflow: &'a Workflow,
    by_role: HashMap<&'a str, &'a SessionMember>,
    work: &'a HashMap<ParticipantId, WorkContext>,
    scheduler: &'a TurnScheduler,
    weights: &'a HashMap<&'a str, f64>,
    policy: QuorumPolicy,
}

impl WorkflowRun<'_> {
    async fn execute(
        &self,
        driver: &mut SessionDriver,
        cancel: &CancellationToken,
        report: &mut WorkflowReport,
    ) -> Result<Vec<RoleOutput>, FailureReason> {
        let mut outputs = Vec::new();
        for wave in self.workflow.waves() {
            driver.check_cancelled(cancel)?;

            let mut slots = Vec::with_capacity(wave.len());
            let mut members: Vec<SessionMember> = Vec::with_capacity(wave.len());
            let mut contexts: HashMap<ParticipantId, WorkContext> = HashMap::new();
            for &i in &wave {
                let step = &self.workflow.steps[i];
                let unfilled = || FailureReason::RoleUnfilled {
                    role: step.role.clone(),
                };
                let member = self.by_role.get(step.role.as_str()).copied().ok_or_else(unfilled)?;
                let mut context = self.work.get(member.id()).cloned().ok_or_else(unfilled)?;
                context.action = Some(step.action.clone());
                slots.push((member.id().to_string(), step.role.clone()));
                contexts.insert(member.id().to_string(), context);
                members.push(member.clone());
            }

            let round = Round::open_roles(driver.next_round_index(), SessionPhase::Executing, &slots);
            let mut collector = driver.collector(round, self.policy);
            let end = self
                .scheduler
                .run_round(&mut collector, &members, Dispatch::Concurrent, invoke_with(&contexts), cancel)
                .await;
            let round = driver.store(collector, end)?;

            let mut stop = None;
            for (&i, member) in wave.iter().zip(&members) {
                let step = &self.workflow.steps[i];
                let status = round.turn(member.id()).map_or(TurnStatus::Failed, |t| t.status);
                if status != TurnStatus::Completed {
                    warn!(
                        session_id = %driver.id(),
                        step = i,
                        role = %step.role,
                        action = %step.action,
                        status = %status,
                        "Workflow step did not complete"
                    );
                    if self.workflow.error_handling == ErrorHandling::Stop && stop.is_none() {
                        stop = Some(FailureReason::StepFailed {
                            step: i,
                            role: step.role.clone(),
                            action: step.action.clone(),
                        });
                    }
                }
                report.steps.push(StepResult {
                    step: i,
                    role: step.role.clone(),
                    action: step.action.clone(),
                    participant_id: member.id().to_string(),
                    round: round.index,
                    status,
                });
            }
            report.steps.sort_by_key(|s| s.step);
            outputs.extend(role_outputs(&round, self.weights));
            if let Some(reason) = stop {
                return Err(reason);
            }
        }
        Ok(outputs)
    }
}

/// Invocation factory handing each member its work context.
fn invoke_with(
    contexts: &HashMap<ParticipantId, WorkContext>,
) -> impl Fn(&SessionMember, &Round) -> Invocation + '_ {
    move |member: &SessionMember, _round: &Round| -> Invocation {
        let agent = member.agent.clone();
        let context = contexts.get(member.id()).cloned();
        async move {
            let context =
                context.ok_or_else(|| ProviderError::unavailable("no role assigned to this participant"))?;
            agent.execute(&context).await.map(TurnContent::Output)
        }
        .boxed()
    }
}

/// Completed role outputs in turn order.
fn role_outputs(round: &Round, weights: &HashMap<&str, f64>) -> Vec<RoleOutput> {
    round
        .completed_turns()
        .filter_map(|turn| {
            let output = turn.content.as_ref()?.as_output()?;
            Some(RoleOutput {
                participant_id: turn.participant_id.clone(),
                role: turn.role.clone().unwrap_or_default(),
                data: output.data.clone(),
                confidence: output.confidence,
                weight: weights.get(turn.participant_id.as_str()).copied().unwrap_or(1.0),
                recorded_at: turn.recorded_at.unwrap_or(DateTime::<Utc>::MAX_UTC),
            })
        })
        .collect()
}
