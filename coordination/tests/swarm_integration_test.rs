//! Swarm assembly integration tests: assemblies loaded from YAML, roles
//! filled from the registry, outputs aggregated per strategy.

use std::time::Duration;

use coordination::{
    AssemblyEngine, AssemblyLoader, CapabilityRegistry, EngineConfig, FailureReason,
    MemorySink, OutcomeSink, Participant, RankedQueue, ScriptedAgent, SessionKind, SessionPhase,
    SharedCapabilityRegistry, TaskSpec, TurnStatus,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

async fn register(registry: &SharedCapabilityRegistry, agent: ScriptedAgent, caps: &[&str]) {
    let id = coordination::Agent::id(&agent).to_string();
    registry
        .register(Participant::new(id, caps.iter().copied()), agent.shared())
        .await
        .unwrap();
}

const TRIAGE: &str = r#"
name: triage
version: "1.2"
strategy: best-of
tags: [support]
roles:
  - name: quick
    capabilities: [fast]
    responsibilities: [first pass]
  - name: deep
    capabilities: [careful]
  - name: wide
    capabilities: [broad]
success_criteria:
  min_confidence: 0.5
"#;

const MERGE: &str = r#"
name: report
strategy: weighted-merge
roles:
  - name: facts
    capabilities: [research]
  - name: tone
    capabilities: [writing]
"#;

fn loader() -> AssemblyLoader {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("triage.yaml"), TRIAGE).unwrap();
    std::fs::write(dir.path().join("report.yml"), MERGE).unwrap();
    std::fs::write(dir.path().join("broken.yaml"), "name: broken\nstrategy: best-of\n").unwrap();
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let mut loader = AssemblyLoader::new();
    let report = loader.load_dir(dir.path()).unwrap();
    assert_eq!(report.loaded, ["report", "triage"]);
    assert_eq!(report.failed.len(), 1);
    loader
}

async fn triage_pool() -> SharedCapabilityRegistry {
    let registry = CapabilityRegistry::new().shared();
    register(
        &registry,
        ScriptedAgent::new("w-fast")
            .with_confidence(0.4)
            .with_output(json!({"severity": "low"})),
        &["fast"],
    )
    .await;
    register(
        &registry,
        ScriptedAgent::new("w-careful")
            .with_confidence(0.9)
            .with_output(json!({"severity": "high"})),
        &["careful", "fast"],
    )
    .await;
    register(
        &registry,
        ScriptedAgent::new("w-broad")
            .with_confidence(0.6)
            .with_output(json!({"severity": "medium"})),
        &["broad"],
    )
    .await;
    registry
}

#[tokio::test]
async fn test_best_of_picks_highest_confidence_output() {
    let loader = loader();
    let assembly = loader.get("triage").unwrap();
    let engine = AssemblyEngine::new(triage_pool().await, &EngineConfig::default()).unwrap();

    let record = engine
        .run(assembly, "Customer reports data loss", None, &CancellationToken::new())
        .await;

    assert!(record.succeeded());
    assert_eq!(record.kind, SessionKind::Assembly);
    let phases: Vec<SessionPhase> = record.transitions.iter().map(|t| t.to).collect();
    assert_eq!(
        phases,
        [
            SessionPhase::Executing,
            SessionPhase::Concluded,
            SessionPhase::Archived
        ]
    );

    // w-careful also holds `fast`, but `deep` can only be filled by it.
    assert_eq!(record.roles.get("deep").map(String::as_str), Some("w-careful"));
    assert_eq!(record.roles.get("quick").map(String::as_str), Some("w-fast"));
    assert_eq!(record.roles.get("wide").map(String::as_str), Some("w-broad"));

    let outcome = record.outcome.as_ref().unwrap();
    assert_eq!(outcome.merged, Some(json!({"severity": "high"})));
    assert_eq!(outcome.winner.as_deref(), Some("deep"));
    assert!(record.validation.as_ref().unwrap().is_valid);
}

#[tokio::test]
async fn test_merge_combines_role_outputs() {
    let loader = loader();
    let registry = CapabilityRegistry::new().shared();
    register(
        &registry,
        ScriptedAgent::new("researcher").with_output(json!({"sources": 3})),
        &["research"],
    )
    .await;
    register(
        &registry,
        ScriptedAgent::new("writer").with_output(json!({"tone": "neutral"})),
        &["writing"],
    )
    .await;
    let engine = AssemblyEngine::new(registry, &EngineConfig::default()).unwrap();

    let record = engine
        .run(loader.get("report").unwrap(), "Draft it", None, &CancellationToken::new())
        .await;

    let merged = record.outcome.as_ref().unwrap().merged.clone().unwrap();
    assert_eq!(merged["sources"].as_f64(), Some(3.0));
    assert_eq!(merged["tone"], json!("neutral"));
}

#[tokio::test(start_paused = true)]
async fn test_slow_worker_times_out_but_assembly_concludes() {
    let loader = loader();
    let registry = CapabilityRegistry::new().shared();
    register(&registry, ScriptedAgent::new("a").with_confidence(0.7).with_output(json!(1)), &["fast"]).await;
    register(&registry, ScriptedAgent::new("b").with_confidence(0.8).with_output(json!(2)), &["careful"]).await;
    register(
        &registry,
        ScriptedAgent::new("c")
            .with_confidence(0.99)
            .with_output(json!(3))
            .with_delay(Duration::from_secs(300)),
        &["broad"],
    )
    .await;
    let engine = AssemblyEngine::new(registry, &EngineConfig::default()).unwrap();

    let record = engine
        .run(loader.get("triage").unwrap(), "x", None, &CancellationToken::new())
        .await;

    assert_eq!(record.phase, SessionPhase::Archived);
    let round = &record.rounds[0];
    assert_eq!(round.turn("c").unwrap().status, TurnStatus::TimedOut);
    assert_eq!(record.outcome.as_ref().unwrap().merged, Some(json!(2)));
}

#[tokio::test]
async fn test_queue_drives_assemblies_into_sink() {
    let loader = loader();
    let engine = AssemblyEngine::new(triage_pool().await, &EngineConfig::default()).unwrap();
    let queue = RankedQueue::new();
    for (id, rank) in [("low", 0.1), ("high", 0.9)] {
        queue
            .push(TaskSpec {
                id: id.to_string(),
                assembly: "triage".to_string(),
                input: format!("ticket {}", id),
                rank,
            })
            .await;
    }

    let sink = MemorySink::new();
    let cancel = CancellationToken::new();
    while let Some(result) = engine.run_next(&loader, &queue, &cancel).await {
        sink.deliver(&result.unwrap()).await.unwrap();
    }

    let records = sink.records().await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].subject, "ticket high");
    assert!(records.iter().all(|r| r.succeeded()));
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let loader = loader();
    let engine = AssemblyEngine::new(triage_pool().await, &EngineConfig::default()).unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let record = engine.run(loader.get("triage").unwrap(), "x", None, &cancel).await;
    assert_eq!(record.phase, SessionPhase::Error);
    assert!(matches!(
        record.failure,
        Some(FailureReason::Cancelled { .. })
    ));
    assert!(record.outcome.is_none());
}
