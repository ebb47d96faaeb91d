//! Assembly definitions: roles, capability requirements and aggregation.
//!
//! Assemblies are YAML documents validated once at load time: an unknown
//! strategy tag or an undefined coordinator role fails here, never mid-run.
//!
//! ```yaml
//! name: code-review
//! strategy: hierarchical
//! coordinator_role: lead
//! roles:
//!   - name: lead
//!     capabilities: [architecture]
//!   - name: security
//!     capabilities: [security, code]
//! success_criteria:
//!   required_outputs: [verdict]
//! workflow:
//!   parallel: true
//!   error_handling: continue
//!   steps:
//!     - { role: security, action: scan }
//!     - { role: lead, action: verdict }
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::selection::Candidate;
use crate::tally::{AggregationStrategy, SuccessCriteria, UnknownStrategyError};

/// Error type for assembly loading and formation
#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid assembly YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Assembly name must not be empty")]
    EmptyName,

    #[error("Assembly '{0}' declares no roles")]
    NoRoles(String),

    #[error("Assembly '{assembly}' declares role '{role}' more than once")]
    DuplicateRole { assembly: String, role: String },

    #[error("Assembly '{assembly}' has a role with an empty name")]
    EmptyRoleName { assembly: String },

    #[error(transparent)]
    UnknownStrategy(#[from] UnknownStrategyError),

    #[error("Assembly '{0}' uses hierarchical aggregation without a coordinator_role")]
    MissingCoordinator(String),

    #[error("Assembly '{assembly}' names undefined coordinator role '{role}'")]
    UnknownCoordinator { assembly: String, role: String },

    #[error("Assembly '{assembly}': {reason}")]
    InvalidCriteria { assembly: String, reason: String },

    #[error("Assembly '{assembly}' workflow step {step} names undefined role '{role}'")]
    UnknownStepRole {
        assembly: String,
        step: usize,
        role: String,
    },

    #[error("Duplicate assembly name '{0}'")]
    DuplicateAssembly(String),

    #[error("No participant can fill role '{0}'")]
    RoleUnfilled(String),

    #[error("Assembly not found: {0}")]
    NotFound(String),
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// What a workflow does when a step fails or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandling {
    /// Fail the session once the failing step's wave has finished.
    #[default]
    Stop,
    /// Record the failure and run the remaining steps.
    Continue,
}

/// One unit of work for an assigned role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub role: String,
    pub action: String,
}

/// Ordered steps an assembly runs instead of a single all-roles round.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Workflow {
    pub steps: Vec<WorkflowStep>,
    /// Dispatch independent steps together.
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub error_handling: ErrorHandling,
}

impl Workflow {
    /// Group step indices into dispatch waves.
    ///
    /// Sequential workflows run one step per wave. Parallel workflows put
    /// each step in the wave after the last one holding a step for the same
    /// role, so a role works one step at a time and keeps its declared order.
    pub fn waves(&self) -> Vec<Vec<usize>> {
        if !self.parallel {
            return (0..self.steps.len()).map(|i| vec![i]).collect();
        }
        let mut waves: Vec<Vec<usize>> = Vec::new();
        let mut next_wave: HashMap<&str, usize> = HashMap::new();
        for (i, step) in self.steps.iter().enumerate() {
            let wave = next_wave.get(step.role.as_str()).copied().unwrap_or(0);
            if waves.len() <= wave {
                waves.resize_with(wave + 1, Vec::new);
            }
            waves[wave].push(i);
            next_wave.insert(step.role.as_str(), wave + 1);
        }
        waves
    }
}

/// A role an assembly needs filled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub name: String,
    /// Tags a participant must all hold to fill this role.
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub responsibilities: Vec<String>,
}

/// Assembly document as written on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct AssemblyDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub roles: Vec<RoleDefinition>,
    pub strategy: String,
    #[serde(default)]
    pub coordinator_role: Option<String>,
    #[serde(default)]
    pub success_criteria: SuccessCriteria,
    #[serde(default)]
    pub max_in_flight: Option<usize>,
    #[serde(default)]
    pub turn_timeout_secs: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub workflow: Option<Workflow>,
}

impl AssemblyDefinition {
    /// Check the definition and resolve its strategy tag.
    pub fn validate(self) -> Result<Assembly, AssemblyError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(AssemblyError::EmptyName);
        }
        if self.roles.is_empty() {
            return Err(AssemblyError::NoRoles(name));
        }

        let mut seen = HashSet::new();
        for role in &self.roles {
            if role.name.trim().is_empty() {
                return Err(AssemblyError::EmptyRoleName { assembly: name });
            }
            if !seen.insert(role.name.as_str()) {
                return Err(AssemblyError::DuplicateRole {
                    assembly: name,
                    role: role.name.clone(),
                });
            }
        }

        let strategy: AggregationStrategy = self.strategy.parse()?;

        match (&self.coordinator_role, strategy) {
            (None, AggregationStrategy::Hierarchical) => {
                return Err(AssemblyError::MissingCoordinator(name));
            }
            (Some(role), _) if !seen.contains(role.as_str()) => {
                return Err(AssemblyError::UnknownCoordinator {
                    assembly: name,
                    role: role.clone(),
                });
            }
            _ => {}
        }

        let criteria = &self.success_criteria;
        if !(0.0..=1.0).contains(&criteria.min_confidence) {
            return Err(AssemblyError::InvalidCriteria {
                assembly: name,
                reason: format!("min_confidence {} outside [0, 1]", criteria.min_confidence),
            });
        }
        if self.max_in_flight == Some(0) {
            return Err(AssemblyError::InvalidCriteria {
                assembly: name,
                reason: "max_in_flight must be at least 1".to_string(),
            });
        }
        if self.turn_timeout_secs == Some(0) {
            return Err(AssemblyError::InvalidCriteria {
                assembly: name,
                reason: "turn_timeout_secs must be at least 1".to_string(),
            });
        }
        if let Some(workflow) = &self.workflow {
            if workflow.steps.is_empty() {
                return Err(AssemblyError::InvalidCriteria {
                    assembly: name,
                    reason: "workflow declares no steps".to_string(),
                });
            }
            if let Some((step, s)) = workflow
                .steps
                .iter()
                .enumerate()
                .find(|(_, s)| !seen.contains(s.role.as_str()))
            {
                return Err(AssemblyError::UnknownStepRole {
                    assembly: name,
                    step,
                    role: s.role.clone(),
                });
            }
        }

        Ok(Assembly {
            name,
            version: self.version,
            description: self.description,
            roles: self.roles,
            strategy,
            coordinator_role: self.coordinator_role,
            success_criteria: self.success_criteria,
            max_in_flight: self.max_in_flight,
            turn_timeout_secs: self.turn_timeout_secs,
            tags: self.tags,
            workflow: self.workflow,
        })
    }
}

/// A validated assembly.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assembly {
    pub name: String,
    pub version: String,
    pub description: String,
    pub roles: Vec<RoleDefinition>,
    pub strategy: AggregationStrategy,
    pub coordinator_role: Option<String>,
    pub success_criteria: SuccessCriteria,
    pub max_in_flight: Option<usize>,
    pub turn_timeout_secs: Option<u64>,
    pub tags: Vec<String>,
    pub workflow: Option<Workflow>,
}

impl Assembly {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, AssemblyError> {
        let definition: AssemblyDefinition = serde_yaml::from_str(yaml)?;
        definition.validate()
    }

    pub fn from_path(path: &Path) -> Result<Self, AssemblyError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| AssemblyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn role(&self, name: &str) -> Option<&RoleDefinition> {
        self.roles.iter().find(|r| r.name == name)
    }

    pub fn turn_timeout(&self) -> Option<Duration> {
        self.turn_timeout_secs.map(Duration::from_secs)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Assign one distinct candidate to every role.
///
/// Eligible candidates hold all of the role's capabilities; among them the
/// closest capability match (Jaccard similarity to the role's tags) wins and
/// the seeded RNG breaks ties. The most constrained roles are filled first.
/// The result follows role declaration order.
pub fn assign_roles<T: Candidate + Clone>(
    roles: &[RoleDefinition],
    pool: &[T],
    rng: &mut StdRng,
) -> Result<Vec<(String, T)>, AssemblyError> {
    let mut candidates: Vec<&T> = pool.iter().collect();
    candidates.sort_by(|a, b| a.participant().id.cmp(&b.participant().id));

    let eligible = |role: &RoleDefinition, c: &T| c.participant().has_all(&role.capabilities);

    let mut order: Vec<usize> = (0..roles.len()).collect();
    order.sort_by_key(|&i| {
        let count = candidates.iter().filter(|c| eligible(&roles[i], **c)).count();
        (count, i)
    });

    let mut taken: HashSet<&str> = HashSet::new();
    let mut filled: Vec<Option<T>> = vec![None; roles.len()];
    for role_idx in order {
        let role = &roles[role_idx];
        let mut best: Vec<&T> = Vec::new();
        let mut best_fit = f64::NEG_INFINITY;
        for &candidate in &candidates {
            let id = candidate.participant().id.as_str();
            if taken.contains(id) || !eligible(role, candidate) {
                continue;
            }
            let fit = role_fit(role, candidate.participant());
            if fit > best_fit {
                best_fit = fit;
                best.clear();
                best.push(candidate);
            } else if fit == best_fit {
                best.push(candidate);
            }
        }

        if best.is_empty() {
            warn!(role = %role.name, "No eligible participant for role");
            return Err(AssemblyError::RoleUnfilled(role.name.clone()));
        }
        let pick = if best.len() == 1 {
            best[0]
        } else {
            best[rng.gen_range(0..best.len())]
        };
        debug!(role = %role.name, participant = %pick.participant().id, fit = best_fit, "Role assigned");
        taken.insert(pick.participant().id.as_str());
        filled[role_idx] = Some(pick.clone());
    }

    roles
        .iter()
        .zip(filled)
        .map(|(role, member)| {
            member
                .map(|m| (role.name.clone(), m))
                .ok_or_else(|| AssemblyError::RoleUnfilled(role.name.clone()))
        })
        .collect()
}

fn role_fit(role: &RoleDefinition, participant: &crate::registry::Participant) -> f64 {
    let declared: HashSet<&str> = participant.capabilities.iter().map(String::as_str).collect();
    let required: HashSet<&str> = role.capabilities.iter().map(String::as_str).collect();
    let union = declared.union(&required).count();
    if union == 0 {
        return 1.0;
    }
    declared.intersection(&required).count() as f64 / union as f64
}

/// Outcome of loading a directory of assemblies.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub failed: Vec<(PathBuf, AssemblyError)>,
}

/// In-memory catalogue of validated assemblies.
#[derive(Debug, Default)]
pub struct AssemblyLoader {
    assemblies: BTreeMap<String, Assembly>,
}

impl AssemblyLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one validated assembly.
    pub fn insert(&mut self, assembly: Assembly) -> Result<(), AssemblyError> {
        if self.assemblies.contains_key(&assembly.name) {
            return Err(AssemblyError::DuplicateAssembly(assembly.name));
        }
        self.assemblies.insert(assembly.name.clone(), assembly);
        Ok(())
    }

    /// Load every `*.yaml`/`*.yml` file in `dir`. Invalid files are reported
    /// and skipped.
    pub fn load_dir(&mut self, dir: &Path) -> Result<LoadReport, AssemblyError> {
        let entries = std::fs::read_dir(dir).map_err(|source| AssemblyError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && matches!(
                        p.extension().and_then(|e| e.to_str()),
                        Some("yaml") | Some("yml")
                    )
            })
            .collect();
        paths.sort();

        let mut report = LoadReport::default();
        for path in paths {
            match Assembly::from_path(&path).and_then(|a| {
                let name = a.name.clone();
                self.insert(a).map(|_| name)
            }) {
                Ok(name) => {
                    debug!(assembly = %name, path = %path.display(), "Assembly loaded");
                    report.loaded.push(name);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping invalid assembly");
                    report.failed.push((path, e));
                }
            }
        }

        info!(
            dir = %dir.display(),
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "Assemblies loaded"
        );
        Ok(report)
    }

    pub fn get(&self, name: &str) -> Result<&Assembly, AssemblyError> {
        self.assemblies
            .get(name)
            .ok_or_else(|| AssemblyError::NotFound(name.to_string()))
    }

    pub fn by_tag(&self, tag: &str) -> Vec<&Assembly> {
        self.assemblies.values().filter(|a| a.has_tag(tag)).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.assemblies.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.assemblies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assemblies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Participant;
    use crate::selection::rng_from_seed;

    const REVIEW: &str = r#"
name: code-review
description: Review a change
strategy: hierarchical
coordinator_role: lead
roles:
  - name: lead
    capabilities: [architecture]
    responsibilities: [final verdict]
  - name: security
    capabilities: [security]
success_criteria:
  required_outputs: [verdict]
tags: [review]
"#;

    fn role(name: &str, caps: &[&str]) -> RoleDefinition {
        RoleDefinition {
            name: name.to_string(),
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            responsibilities: vec![],
        }
    }

    #[test]
    fn test_parse_valid_assembly() {
        let assembly = Assembly::from_yaml_str(REVIEW).unwrap();
        assert_eq!(assembly.name, "code-review");
        assert_eq!(assembly.version, "1.0.0");
        assert_eq!(assembly.strategy, AggregationStrategy::Hierarchical);
        assert_eq!(assembly.success_criteria.min_confidence, 0.7);
        assert_eq!(assembly.success_criteria.max_conflicts, 3);
        assert!(assembly.has_tag("review"));
        assert!(assembly.turn_timeout().is_none());
    }

    #[test]
    fn test_unknown_strategy_fails_at_load() {
        let yaml = "name: x\nstrategy: telepathy\nroles:\n  - name: a\n";
        let err = Assembly::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, AssemblyError::UnknownStrategy(_)));
        assert!(err.to_string().contains("telepathy"));
    }

    #[test]
    fn test_structural_validation() {
        let no_roles = "name: x\nstrategy: majority\n";
        assert!(matches!(
            Assembly::from_yaml_str(no_roles).unwrap_err(),
            AssemblyError::NoRoles(_)
        ));

        let dup = "name: x\nstrategy: majority\nroles:\n  - name: a\n  - name: a\n";
        assert!(matches!(
            Assembly::from_yaml_str(dup).unwrap_err(),
            AssemblyError::DuplicateRole { .. }
        ));

        let no_coord = "name: x\nstrategy: hierarchical\nroles:\n  - name: a\n";
        assert!(matches!(
            Assembly::from_yaml_str(no_coord).unwrap_err(),
            AssemblyError::MissingCoordinator(_)
        ));

        let bad_coord = "name: x\nstrategy: best-of\ncoordinator_role: z\nroles:\n  - name: a\n";
        assert!(matches!(
            Assembly::from_yaml_str(bad_coord).unwrap_err(),
            AssemblyError::UnknownCoordinator { .. }
        ));

        let blank = "name: '  '\nstrategy: majority\nroles:\n  - name: a\n";
        assert!(matches!(
            Assembly::from_yaml_str(blank).unwrap_err(),
            AssemblyError::EmptyName
        ));
    }

    #[test]
    fn test_workflow_parsed_and_checked() {
        let yaml = format!(
            "{}workflow:\n  parallel: true\n  error_handling: continue\n  steps:\n    - {{ role: security, action: scan }}\n    - {{ role: lead, action: verdict }}\n",
            REVIEW.trim_start()
        );
        let assembly = Assembly::from_yaml_str(&yaml).unwrap();
        let workflow = assembly.workflow.unwrap();
        assert!(workflow.parallel);
        assert_eq!(workflow.error_handling, ErrorHandling::Continue);
        assert_eq!(workflow.steps[1].action, "verdict");

        let unknown = "name: x\nstrategy: majority\nroles:\n  - name: a\nworkflow:\n  steps:\n    - { role: b, action: go }\n";
        assert!(matches!(
            Assembly::from_yaml_str(unknown).unwrap_err(),
            AssemblyError::UnknownStepRole { step: 0, .. }
        ));

        let empty = "name: x\nstrategy: majority\nroles:\n  - name: a\nworkflow:\n  steps: []\n";
        assert!(matches!(
            Assembly::from_yaml_str(empty).unwrap_err(),
            AssemblyError::InvalidCriteria { .. }
        ));

        let retry = "name: x\nstrategy: majority\nroles:\n  - name: a\nworkflow:\n  error_handling: retry\n  steps:\n    - { role: a, action: go }\n";
        assert!(matches!(
            Assembly::from_yaml_str(retry).unwrap_err(),
            AssemblyError::Yaml(_)
        ));
    }

    #[test]
    fn test_workflow_waves() {
        let step = |role: &str, action: &str| WorkflowStep {
            role: role.to_string(),
            action: action.to_string(),
        };
        let mut workflow = Workflow {
            steps: vec![
                step("a", "draft"),
                step("b", "check"),
                step("a", "revise"),
                step("c", "publish"),
            ],
            parallel: false,
            error_handling: ErrorHandling::Stop,
        };
        assert_eq!(workflow.waves(), vec![vec![0], vec![1], vec![2], vec![3]]);

        workflow.parallel = true;
        assert_eq!(workflow.waves(), vec![vec![0, 1, 3], vec![2]]);
    }

    #[test]
    fn test_assign_roles_prefers_closest_match() {
        let roles = vec![role("security", &["security"]), role("lead", &["architecture"])];
        let pool = vec![
            Participant::new("generalist", ["security", "architecture", "code"]),
            Participant::new("specialist", ["security"]),
            Participant::new("architect", ["architecture"]),
        ];
        let mut rng = rng_from_seed(b"roles");
        let assigned = assign_roles(&roles, &pool, &mut rng).unwrap();
        assert_eq!(assigned[0].0, "security");
        assert_eq!(assigned[0].1.id, "specialist");
        assert_eq!(assigned[1].1.id, "architect");
    }

    #[test]
    fn test_assign_roles_fills_constrained_roles_first() {
        // Declaration-order greedy would give "any" the only "rare" holder.
        let roles = vec![role("any", &[]), role("rare", &["rare"])];
        let pool = vec![
            Participant::new("a", ["rare"]),
            Participant::new("b", Vec::<String>::new()),
        ];
        let mut rng = rng_from_seed(b"x");
        let assigned = assign_roles(&roles, &pool, &mut rng).unwrap();
        assert_eq!(assigned[1].1.id, "a");
        assert_eq!(assigned[0].1.id, "b");
    }

    #[test]
    fn test_assign_roles_is_seed_deterministic() {
        let roles = vec![role("worker", &["code"])];
        let pool: Vec<Participant> = (0..6)
            .map(|i| Participant::new(format!("w{}", i), ["code"]))
            .collect();
        let first = assign_roles(&roles, &pool, &mut rng_from_seed(b"s")).unwrap();
        let again = assign_roles(&roles, &pool, &mut rng_from_seed(b"s")).unwrap();
        assert_eq!(first[0].1.id, again[0].1.id);
    }

    #[test]
    fn test_unfilled_role() {
        let roles = vec![role("a", &["x"]), role("b", &["x"])];
        let pool = vec![Participant::new("only", ["x"])];
        let err = assign_roles(&roles, &pool, &mut rng_from_seed(b"s")).unwrap_err();
        assert!(matches!(err, AssemblyError::RoleUnfilled(_)));
    }

    #[test]
    fn test_load_dir_skips_invalid() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("review.yaml"), REVIEW).unwrap();
        std::fs::write(
            dir.path().join("summary.yml"),
            "name: summary\nstrategy: concatenation\nroles:\n  - name: writer\ntags: [docs]\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "name: b\nstrategy: nope\nroles: [{name: a}]\n")
            .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut loader = AssemblyLoader::new();
        let report = loader.load_dir(dir.path()).unwrap();
        assert_eq!(report.loaded, vec!["code-review", "summary"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(loader.len(), 2);
        assert_eq!(loader.get("summary").unwrap().strategy, AggregationStrategy::Concatenation);
        assert_eq!(loader.by_tag("review").len(), 1);
        assert!(matches!(loader.get("missing"), Err(AssemblyError::NotFound(_))));
    }
}
