//! Turn Scheduler: dispatches one round of participant invocations.
//!
//! Concurrent rounds fan out over a `JoinSet`, optionally bounded by a
//! semaphore; every invocation races its deadline and reports an [`Arrival`]
//! over an mpsc channel drained by the round's [`Collector`]. Sequential
//! rounds invoke speakers one at a time so each sees the earlier speakers of
//! the same round.
//!
//! Cancellation is checked before every arrival is processed: in-flight
//! tasks are aborted and their turns marked timed-out. Registry health is
//! written once the round's dispatch has ended, never while arrivals are
//! still being drained.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::ProviderError;
use crate::collector::{Arrival, ArrivalResult, Collector};
use crate::registry::{ParticipantId, SessionMember, SharedCapabilityRegistry, TurnReport};
use crate::session::{Round, TurnContent, TurnStatus};

/// How discussion rounds are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscussionMode {
    /// One speaker at a time; each sees earlier speakers of the same round.
    #[default]
    Sequential,
    /// Everyone at once, seeing only earlier rounds.
    Blind,
}

impl FromStr for DiscussionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "blind" | "concurrent" => Ok(Self::Blind),
            other => Err(format!("unknown discussion mode: {}", other)),
        }
    }
}

/// Invocation order within a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Concurrent,
    Sequential,
}

/// How a round's dispatch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundEnd {
    /// Every turn reached a terminal status.
    Finished,
    /// The session was cancelled mid-round.
    Cancelled,
}

/// A pending participant invocation.
pub type Invocation = BoxFuture<'static, Result<TurnContent, ProviderError>>;

/// Dispatches invocations for one round at a time.
#[derive(Clone)]
pub struct TurnScheduler {
    deadline: Duration,
    max_in_flight: Option<usize>,
    registry: Option<SharedCapabilityRegistry>,
}

impl TurnScheduler {
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            max_in_flight: None,
            registry: None,
        }
    }

    /// Bound concurrent invocations. `None` is unbounded.
    pub fn with_max_in_flight(mut self, max_in_flight: Option<usize>) -> Self {
        self.max_in_flight = max_in_flight.map(|n| n.max(1));
        self
    }

    /// Report every finished turn to the registry's health bookkeeping.
    pub fn with_registry(mut self, registry: SharedCapabilityRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Run one round. `invoke` builds the invocation for a member given the
    /// round as it stands when that member is dispatched.
    pub async fn run_round<F>(
        &self,
        collector: &mut Collector,
        members: &[SessionMember],
        dispatch: Dispatch,
        invoke: F,
        cancel: &CancellationToken,
    ) -> RoundEnd
    where
        F: Fn(&SessionMember, &Round) -> Invocation,
    {
        let end = match dispatch {
            Dispatch::Concurrent => self.run_concurrent(collector, members, invoke, cancel).await,
            Dispatch::Sequential => self.run_sequential(collector, members, invoke, cancel).await,
        };
        debug!(
            round = collector.round().index,
            phase = %collector.round().phase,
            responded = collector.round().responded(),
            expected = collector.round().expected(),
            end = ?end,
            "Round dispatch finished"
        );
        end
    }

    async fn run_concurrent<F>(
        &self,
        collector: &mut Collector,
        members: &[SessionMember],
        invoke: F,
        cancel: &CancellationToken,
    ) -> RoundEnd
    where
        F: Fn(&SessionMember, &Round) -> Invocation,
    {
        let (tx, mut rx) = mpsc::channel::<Arrival>(members.len().max(1));
        let semaphore = self.max_in_flight.map(|n| Arc::new(Semaphore::new(n)));
        let mut tasks: JoinSet<()> = JoinSet::new();

        for member in members {
            let invocation = invoke(member, collector.round());
            let participant = member.id().to_string();
            let semaphore = semaphore.clone();
            let deadline = self.deadline;
            let tx = tx.clone();

            tasks.spawn(async move {
                let _permit = match semaphore {
                    Some(sem) => match sem.acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => return,
                    },
                    None => None,
                };
                let arrival = race_deadline(&participant, invocation, deadline).await;
                let _ = tx.send(arrival).await;
            });
        }
        drop(tx);

        let mut reports = Vec::new();
        let end = loop {
            if !collector.has_pending() {
                break RoundEnd::Finished;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    collector.expire_pending(TurnStatus::TimedOut, "session cancelled");
                    break RoundEnd::Cancelled;
                }
                arrival = rx.recv() => match arrival {
                    Some(arrival) => {
                        reports.push(report_of(&arrival));
                        collector.observe(arrival);
                    }
                    None => {
                        // Every sender is gone; a task ended without reporting.
                        collector.expire_pending(TurnStatus::Failed, "invocation ended without a result");
                        break RoundEnd::Finished;
                    }
                }
            }
        };

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    warn!(error = %e, "Invocation task panicked");
                }
            }
        }
        self.flush_reports(reports, end).await;
        end
    }

    async fn run_sequential<F>(
        &self,
        collector: &mut Collector,
        members: &[SessionMember],
        invoke: F,
        cancel: &CancellationToken,
    ) -> RoundEnd
    where
        F: Fn(&SessionMember, &Round) -> Invocation,
    {
        let mut reports = Vec::new();
        let mut end = RoundEnd::Finished;
        for member in members {
            if cancel.is_cancelled() {
                end = RoundEnd::Cancelled;
                break;
            }

            let invocation = invoke(member, collector.round());
            let arrival = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    end = RoundEnd::Cancelled;
                    break;
                }
                arrival = race_deadline(member.id(), invocation, self.deadline) => arrival,
            };
            reports.push(report_of(&arrival));
            collector.observe(arrival);
        }

        match end {
            RoundEnd::Cancelled => {
                collector.expire_pending(TurnStatus::TimedOut, "session cancelled");
            }
            RoundEnd::Finished => {
                // Members missing from the round's turn list never get an arrival.
                collector.expire_pending(TurnStatus::Failed, "participant was not dispatched");
            }
        }
        self.flush_reports(reports, end).await;
        end
    }

    /// Write a round's health reports. A cancelled round hands them to a
    /// background task so a busy registry cannot hold up the caller.
    async fn flush_reports(&self, reports: Vec<(ParticipantId, TurnReport)>, end: RoundEnd) {
        let Some(registry) = &self.registry else {
            return;
        };
        match end {
            RoundEnd::Finished => registry.record_batch(reports).await,
            RoundEnd::Cancelled => {
                let registry = registry.clone();
                tokio::spawn(async move { registry.record_batch(reports).await });
            }
        }
    }
}

fn report_of(arrival: &Arrival) -> (ParticipantId, TurnReport) {
    let report = match &arrival.result {
        ArrivalResult::Content(_) => TurnReport::Completed {
            latency_ms: arrival.duration_ms,
        },
        ArrivalResult::Failed(_) => TurnReport::Failed,
        ArrivalResult::TimedOut => TurnReport::TimedOut,
    };
    (arrival.participant_id.clone(), report)
}

/// Race an invocation against its deadline.
async fn race_deadline(participant: &str, invocation: Invocation, deadline: Duration) -> Arrival {
    let started = Instant::now();
    let result = tokio::time::timeout(deadline, invocation).await;
    let elapsed = started.elapsed().as_millis() as u64;
    match result {
        Ok(Ok(content)) => Arrival::content(participant, content, elapsed),
        Ok(Err(ProviderError::Timeout { .. })) => Arrival::timed_out(participant, elapsed),
        Ok(Err(err)) => Arrival::failed(participant, err.to_string(), elapsed),
        Err(_) => Arrival::timed_out(participant, elapsed),
    }
}
