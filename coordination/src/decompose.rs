//! Task decomposition: subtasks with dependencies, levelled into batches.
//!
//! A [`Decomposition`] orders subtasks into batches that can run side by
//! side: every subtask in batch `n` has all of its blocking dependencies in
//! batches `0..n`. A dependency cycle is an error, never a truncated plan.
//!
//! [`TaskDecomposer`] fills a decomposition from a phase template per
//! [`TaskKind`], each phase blocking on the previous one.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Error type for decomposition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecomposeError {
    #[error("Duplicate subtask id '{0}'")]
    DuplicateTask(String),

    #[error("Subtask '{task}' depends on unknown subtask '{depends_on}'")]
    UnknownDependency { task: String, depends_on: String },

    #[error("Dependency cycle among subtasks: {}", remaining.join(", "))]
    Cycle { remaining: Vec<String> },
}

/// How strongly one subtask depends on another. Only `blocks` gates readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    #[default]
    Blocks,
    Requires,
    Suggests,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub task_id: String,
    #[serde(default)]
    pub kind: DependencyKind,
}

impl Dependency {
    pub fn blocks(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            kind: DependencyKind::Blocks,
        }
    }
}

/// One unit of work produced by a decomposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Capability tags a participant needs to take this on.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Estimated effort in points.
    #[serde(default)]
    pub effort: u32,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

impl Subtask {
    pub fn new(id: impl Into<String>, title: impl Into<String>, effort: u32) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            capabilities: Vec::new(),
            effort,
            dependencies: Vec::new(),
            acceptance_criteria: Vec::new(),
        }
    }

    pub fn after(mut self, task_id: impl Into<String>) -> Self {
        self.dependencies.push(Dependency::blocks(task_id));
        self
    }

    pub fn with_dependency(mut self, task_id: impl Into<String>, kind: DependencyKind) -> Self {
        self.dependencies.push(Dependency {
            task_id: task_id.into(),
            kind,
        });
        self
    }

    fn blockers(&self) -> impl Iterator<Item = &str> {
        self.dependencies
            .iter()
            .filter(|d| d.kind == DependencyKind::Blocks)
            .map(|d| d.task_id.as_str())
    }

    /// True once every blocking dependency is in `completed`.
    pub fn is_ready(&self, completed: &HashSet<String>) -> bool {
        self.blockers().all(|id| completed.contains(id))
    }
}

/// Check ids are unique and every dependency names a known subtask.
fn check_graph(subtasks: &[Subtask]) -> Result<(), DecomposeError> {
    let mut ids = HashSet::with_capacity(subtasks.len());
    for task in subtasks {
        if !ids.insert(task.id.as_str()) {
            return Err(DecomposeError::DuplicateTask(task.id.clone()));
        }
    }
    for task in subtasks {
        if let Some(dep) = task
            .dependencies
            .iter()
            .find(|d| !ids.contains(d.task_id.as_str()))
        {
            return Err(DecomposeError::UnknownDependency {
                task: task.id.clone(),
                depends_on: dep.task_id.clone(),
            });
        }
    }
    Ok(())
}

/// Level subtasks into batches over their blocking dependencies.
///
/// Batches keep declaration order. Fails on duplicate ids, dangling
/// dependencies and cycles.
pub fn execution_order(subtasks: &[Subtask]) -> Result<Vec<Vec<String>>, DecomposeError> {
    check_graph(subtasks)?;

    let mut completed: HashSet<String> = HashSet::with_capacity(subtasks.len());
    let mut order = Vec::new();
    while completed.len() < subtasks.len() {
        let batch: Vec<String> = subtasks
            .iter()
            .filter(|t| !completed.contains(&t.id) && t.is_ready(&completed))
            .map(|t| t.id.clone())
            .collect();
        if batch.is_empty() {
            let remaining = subtasks
                .iter()
                .filter(|t| !completed.contains(&t.id))
                .map(|t| t.id.clone())
                .collect();
            return Err(DecomposeError::Cycle { remaining });
        }
        completed.extend(batch.iter().cloned());
        order.push(batch);
    }
    Ok(order)
}

/// The chain of blocking dependencies with the largest summed effort.
///
/// `order` must come from [`execution_order`] over the same subtasks. Ties
/// go to the subtask declared first.
pub fn critical_path(subtasks: &[Subtask], order: &[Vec<String>]) -> Vec<String> {
    let by_id: HashMap<&str, &Subtask> = subtasks.iter().map(|t| (t.id.as_str(), t)).collect();
    // id -> (cumulative effort, predecessor on the path)
    let mut best: HashMap<&str, (u64, Option<&str>)> = HashMap::with_capacity(subtasks.len());

    for id in order.iter().flatten() {
        let Some(task) = by_id.get(id.as_str()) else {
            continue;
        };
        let mut lead: Option<(u64, &str)> = None;
        for dep in task.blockers() {
            if let Some(&(cost, _)) = best.get(dep) {
                if lead.map_or(true, |(c, _)| cost > c) {
                    lead = Some((cost, dep));
                }
            }
        }
        let base = lead.map_or(0, |(c, _)| c);
        best.insert(
            task.id.as_str(),
            (base + u64::from(task.effort), lead.map(|(_, d)| d)),
        );
    }

    let mut end: Option<(u64, &str)> = None;
    for task in subtasks {
        if let Some(&(cost, _)) = best.get(task.id.as_str()) {
            if end.map_or(true, |(c, _)| cost > c) {
                end = Some((cost, task.id.as_str()));
            }
        }
    }

    let mut path = Vec::new();
    let mut cursor = end.map(|(_, id)| id);
    while let Some(id) = cursor {
        path.push(id.to_string());
        cursor = best.get(id).and_then(|(_, prev)| *prev);
    }
    path.reverse();
    path
}

/// A task broken into ordered subtasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decomposition {
    pub original_task: String,
    pub subtasks: Vec<Subtask>,
    /// Batches of subtask ids; each batch can run in parallel.
    pub execution_order: Vec<Vec<String>>,
    pub total_effort: u64,
    pub critical_path: Vec<String>,
}

impl Decomposition {
    pub fn from_subtasks(
        original_task: impl Into<String>,
        subtasks: Vec<Subtask>,
    ) -> Result<Self, DecomposeError> {
        let execution_order = execution_order(&subtasks)?;
        let critical_path = critical_path(&subtasks, &execution_order);
        let total_effort = subtasks.iter().map(|t| u64::from(t.effort)).sum();
        Ok(Self {
            original_task: original_task.into(),
            subtasks,
            execution_order,
            total_effort,
            critical_path,
        })
    }

    pub fn subtask(&self, id: &str) -> Option<&Subtask> {
        self.subtasks.iter().find(|t| t.id == id)
    }

    /// Subtasks not in `completed` whose blocking dependencies all are.
    pub fn ready(&self, completed: &HashSet<String>) -> Vec<&Subtask> {
        self.subtasks
            .iter()
            .filter(|t| !completed.contains(&t.id) && t.is_ready(completed))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Unknown task kind '{0}'")]
pub struct UnknownTaskKindError(pub String);

/// Phase template family used by [`TaskDecomposer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Development,
    Research,
    Analysis,
    Testing,
    Documentation,
    Architecture,
}

/// (phase id, title, capabilities, effort)
type Phase = (&'static str, &'static str, &'static [&'static str], u32);

const DEVELOPMENT: &[Phase] = &[
    ("design", "Design component architecture", &["architecture", "design"], 3),
    ("implement", "Implement core functionality", &["coding", "development"], 5),
    ("test", "Write and execute tests", &["testing", "qa"], 3),
    ("integrate", "Integrate with existing system", &["integration", "development"], 2),
    ("document", "Write documentation", &["documentation", "writing"], 2),
];

const RESEARCH: &[Phase] = &[
    ("survey", "Literature survey", &["research", "analysis"], 2),
    ("collect", "Data collection", &["research", "data"], 3),
    ("analyze", "Data analysis", &["analysis", "statistics"], 4),
    ("synthesize", "Synthesize findings", &["research", "writing"], 2),
    ("report", "Write research report", &["documentation", "writing"], 3),
];

const ANALYSIS: &[Phase] = &[
    ("scope", "Define analysis scope", &["analysis", "planning"], 2),
    ("gather", "Gather data", &["research", "data"], 3),
    ("process", "Process and clean data", &["data", "analysis"], 3),
    ("analyze", "Perform analysis", &["analysis", "statistics"], 4),
    ("visualize", "Create visualizations", &["visualization", "data"], 2),
    ("report", "Write analysis report", &["documentation", "writing"], 2),
];

const TESTING: &[Phase] = &[
    ("plan", "Create test plan", &["testing", "planning"], 2),
    ("unit", "Write unit tests", &["testing", "coding"], 3),
    ("integration", "Write integration tests", &["testing", "coding"], 3),
    ("e2e", "Write end-to-end tests", &["testing", "qa"], 2),
    ("execute", "Execute test suite", &["testing", "qa"], 2),
    ("report", "Generate test report", &["documentation", "testing"], 1),
];

const DOCUMENTATION: &[Phase] = &[
    ("outline", "Create documentation outline", &["documentation", "planning"], 1),
    ("draft", "Write first draft", &["documentation", "writing"], 3),
    ("review", "Review and refine", &["documentation", "editing"], 2),
    ("examples", "Add code examples", &["documentation", "coding"], 2),
    ("finalize", "Finalize documentation", &["documentation", "writing"], 1),
];

const ARCHITECTURE: &[Phase] = &[
    ("requirements", "Gather requirements", &["architecture", "analysis"], 2),
    ("design", "Design system architecture", &["architecture", "design"], 4),
    ("document", "Document architecture", &["documentation", "architecture"], 3),
    ("review", "Architecture review", &["architecture", "review"], 2),
    ("refine", "Refine based on feedback", &["architecture", "design"], 2),
];

impl TaskKind {
    pub const ALL: [TaskKind; 6] = [
        TaskKind::Development,
        TaskKind::Research,
        TaskKind::Analysis,
        TaskKind::Testing,
        TaskKind::Documentation,
        TaskKind::Architecture,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            TaskKind::Development => "development",
            TaskKind::Research => "research",
            TaskKind::Analysis => "analysis",
            TaskKind::Testing => "testing",
            TaskKind::Documentation => "documentation",
            TaskKind::Architecture => "architecture",
        }
    }

    fn phases(self) -> &'static [Phase] {
        match self {
            TaskKind::Development => DEVELOPMENT,
            TaskKind::Research => RESEARCH,
            TaskKind::Analysis => ANALYSIS,
            TaskKind::Testing => TESTING,
            TaskKind::Documentation => DOCUMENTATION,
            TaskKind::Architecture => ARCHITECTURE,
        }
    }
}

impl FromStr for TaskKind {
    type Err = UnknownTaskKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_lowercase();
        TaskKind::ALL
            .into_iter()
            .find(|k| k.tag() == tag)
            .ok_or_else(|| UnknownTaskKindError(s.to_string()))
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Breaks a task description into phased subtasks.
///
/// Ids are `<phase>_<counter>` with a counter that keeps running across
/// calls, so subtasks from separate decompositions never collide.
#[derive(Debug, Default)]
pub struct TaskDecomposer {
    counter: u64,
}

impl TaskDecomposer {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self, phase: &str) -> String {
        self.counter += 1;
        format!("{}_{:04}", phase, self.counter)
    }

    pub fn decompose(
        &mut self,
        description: &str,
        kind: TaskKind,
    ) -> Result<Decomposition, DecomposeError> {
        info!(kind = %kind, task = description, "Decomposing task");

        let mut subtasks: Vec<Subtask> = Vec::with_capacity(kind.phases().len());
        for &(phase, title, capabilities, effort) in kind.phases() {
            let id = self.next_id(phase);
            let mut task = Subtask::new(id, format!("{}: {}", title, description), effort);
            task.description = format!("{} for: {}", title, description);
            task.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
            task.acceptance_criteria = vec![format!("Complete {}", title.to_lowercase())];
            if let Some(prev) = subtasks.last() {
                task.dependencies.push(Dependency::blocks(prev.id.clone()));
            }
            subtasks.push(task);
        }

        let decomposition = Decomposition::from_subtasks(description, subtasks)?;
        debug!(
            subtasks = decomposition.subtasks.len(),
            total_effort = decomposition.total_effort,
            "Decomposed"
        );
        Ok(decomposition)
    }
}
