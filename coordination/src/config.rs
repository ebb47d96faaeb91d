//! Engine configuration.
//!
//! Defaults, overlaid by an optional TOML file, overlaid by `COUNCIL_*`
//! environment variables, then validated.
//!
//! ```toml
//! [selection]
//! council_size = 5
//! diversity_target = 0.5
//!
//! [debate]
//! max_rounds = 2
//! early_stop_threshold = 0.9
//! quorum = 0.6
//! discussion_mode = "sequential"
//!
//! [swarm]
//! max_in_flight = 4
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::collector::QuorumPolicy;
use crate::scheduler::DiscussionMode;
use crate::selection::SelectionConfig;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Debate policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebatePolicy {
    /// Discussion rounds after the opening round.
    pub max_rounds: u32,
    /// Running consensus estimate that ends discussion early.
    pub early_stop_threshold: f64,
    pub quorum: f64,
    pub failure_fraction: f64,
    pub turn_timeout_secs: u64,
    pub discussion_mode: DiscussionMode,
}

impl Default for DebatePolicy {
    fn default() -> Self {
        Self {
            max_rounds: 2,
            early_stop_threshold: 0.9,
            quorum: 0.6,
            failure_fraction: 0.5,
            turn_timeout_secs: 30,
            discussion_mode: DiscussionMode::Sequential,
        }
    }
}

impl DebatePolicy {
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }

    pub fn quorum_policy(&self) -> QuorumPolicy {
        QuorumPolicy {
            quorum: self.quorum,
            failure_fraction: self.failure_fraction,
        }
    }
}

/// Swarm execution policy. Assembly definitions may override the deadline
/// and in-flight bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmPolicy {
    /// `None` is unbounded.
    pub max_in_flight: Option<usize>,
    pub turn_timeout_secs: u64,
    pub quorum: f64,
    pub failure_fraction: f64,
}

impl Default for SwarmPolicy {
    fn default() -> Self {
        Self {
            max_in_flight: None,
            turn_timeout_secs: 30,
            quorum: 0.6,
            failure_fraction: 0.5,
        }
    }
}

impl SwarmPolicy {
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }

    pub fn quorum_policy(&self) -> QuorumPolicy {
        QuorumPolicy {
            quorum: self.quorum,
            failure_fraction: self.failure_fraction,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub selection: SelectionConfig,
    pub debate: DebatePolicy,
    pub swarm: SwarmPolicy,
}

impl EngineConfig {
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Defaults or `path`, then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_path(path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Override from `COUNCIL_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    /// Override from any variable source. Unparsable values are logged and ignored.
    pub fn apply_vars<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(key, value = %raw, "Ignoring unparsable config override");
                    None
                }
            }
        }

        if let Some(n) = parsed("COUNCIL_SIZE", lookup("COUNCIL_SIZE")) {
            self.selection.council_size = n;
        }
        if let Some(d) = parsed("COUNCIL_DIVERSITY", lookup("COUNCIL_DIVERSITY")) {
            self.selection.diversity_target = d;
        }
        if let Some(n) = parsed("COUNCIL_MAX_ROUNDS", lookup("COUNCIL_MAX_ROUNDS")) {
            self.debate.max_rounds = n;
        }
        if let Some(q) = parsed::<f64>("COUNCIL_QUORUM", lookup("COUNCIL_QUORUM")) {
            self.debate.quorum = q;
            self.swarm.quorum = q;
        }
        if let Some(f) = parsed::<f64>("COUNCIL_FAILURE_FRACTION", lookup("COUNCIL_FAILURE_FRACTION")) {
            self.debate.failure_fraction = f;
            self.swarm.failure_fraction = f;
        }
        if let Some(t) = parsed("COUNCIL_EARLY_STOP", lookup("COUNCIL_EARLY_STOP")) {
            self.debate.early_stop_threshold = t;
        }
        if let Some(s) = parsed::<u64>("COUNCIL_TURN_TIMEOUT_SECS", lookup("COUNCIL_TURN_TIMEOUT_SECS")) {
            self.debate.turn_timeout_secs = s;
            self.swarm.turn_timeout_secs = s;
        }
        if let Some(raw) = lookup("COUNCIL_MAX_IN_FLIGHT") {
            if raw.trim().eq_ignore_ascii_case("unbounded") {
                self.swarm.max_in_flight = None;
            } else if let Some(n) = parsed("COUNCIL_MAX_IN_FLIGHT", Some(raw)) {
                self.swarm.max_in_flight = Some(n);
            }
        }
        if let Some(mode) = parsed("COUNCIL_DISCUSSION_MODE", lookup("COUNCIL_DISCUSSION_MODE")) {
            self.debate.discussion_mode = mode;
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fraction = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("{} must be within [0, 1], got {}", name, v)))
            }
        };

        if self.selection.council_size == 0 {
            return Err(ConfigError::Invalid("selection.council_size must be at least 1".into()));
        }
        fraction("selection.diversity_target", self.selection.diversity_target)?;
        fraction("debate.early_stop_threshold", self.debate.early_stop_threshold)?;
        fraction("debate.quorum", self.debate.quorum)?;
        fraction("debate.failure_fraction", self.debate.failure_fraction)?;
        fraction("swarm.quorum", self.swarm.quorum)?;
        fraction("swarm.failure_fraction", self.swarm.failure_fraction)?;
        if self.debate.turn_timeout_secs == 0 || self.swarm.turn_timeout_secs == 0 {
            return Err(ConfigError::Invalid("turn_timeout_secs must be at least 1".into()));
        }
        if self.swarm.max_in_flight == Some(0) {
            return Err(ConfigError::Invalid("swarm.max_in_flight must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.selection.council_size, 5);
        assert_eq!(config.debate.max_rounds, 2);
        assert_eq!(config.debate.early_stop_threshold, 0.9);
        assert_eq!(config.debate.quorum, 0.6);
        assert_eq!(config.debate.failure_fraction, 0.5);
        assert_eq!(config.debate.turn_timeout(), Duration::from_secs(30));
        assert_eq!(config.debate.discussion_mode, DiscussionMode::Sequential);
        assert_eq!(config.swarm.max_in_flight, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
[debate]
max_rounds = 0
discussion_mode = "blind"

[swarm]
max_in_flight = 3
"#,
        )
        .unwrap();
        assert_eq!(config.debate.max_rounds, 0);
        assert_eq!(config.debate.discussion_mode, DiscussionMode::Blind);
        assert_eq!(config.debate.quorum, 0.6);
        assert_eq!(config.swarm.max_in_flight, Some(3));
        assert_eq!(config.selection.council_size, 5);
    }

    #[test]
    fn test_bad_toml() {
        assert!(matches!(
            EngineConfig::from_toml_str("[debate]\nmax_rounds = \"many\""),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("COUNCIL_SIZE", "7"),
            ("COUNCIL_QUORUM", "0.8"),
            ("COUNCIL_TURN_TIMEOUT_SECS", "5"),
            ("COUNCIL_MAX_IN_FLIGHT", "2"),
            ("COUNCIL_DISCUSSION_MODE", "blind"),
            ("COUNCIL_MAX_ROUNDS", "lots"),
        ]);
        let mut config = EngineConfig::default();
        config.apply_vars(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.selection.council_size, 7);
        assert_eq!(config.debate.quorum, 0.8);
        assert_eq!(config.swarm.quorum, 0.8);
        assert_eq!(config.swarm.turn_timeout_secs, 5);
        assert_eq!(config.swarm.max_in_flight, Some(2));
        assert_eq!(config.debate.discussion_mode, DiscussionMode::Blind);
        // unparsable value ignored
        assert_eq!(config.debate.max_rounds, 2);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut config = EngineConfig::default();
        config.debate.quorum = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = EngineConfig::default();
        config.selection.council_size = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.debate.turn_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "[selection]\ncouncil_size = 3\n").unwrap();
        assert_eq!(EngineConfig::from_path(&path).unwrap().selection.council_size, 3);
        assert!(matches!(
            EngineConfig::from_path(&dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
