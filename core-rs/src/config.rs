/**
 * config.rs
 * Parser for envport.yaml (declarative environment source)
 *
 * Format:
 * ```yaml
 * apiVersion: envport/v1
 * kind: PortRegistry
 * spec:
 *   environments:
 *     - id: development
 *       name: Development
 *       range: { start: 21000, end: 21999 }
 *       services: { api: 21001, database: 21432 }
 *   reservedRanges:
 *     - { start: 0, end: 1023, description: IANA well-known system ports }
 *   probe: { timeoutMs: 1000, concurrency: 32 }
 *   monitor: { intervalMs: 5000, historyLimit: 1000, debouncePolls: 2 }
 *   scoring: { candidatePool: 256, weights: { inRange: 30, availability: 40 } }
 *   severity: { inUse: high, crossEnvironment: critical }
 *   allowList: { api: [node, api] }
 * ```
 *
 * Every section of `spec` is optional; omitted sections take built-in defaults.
 */

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::detector::SeverityPolicy;
use crate::errors::{EnvPortError, Result};
use crate::registry::{default_reserved_ranges, Environment, EnvironmentId, ReservedRange, ServiceName};
use crate::scorer::ScoreWeights;

pub const API_VERSION: &str = "envport/v1";
pub const KIND: &str = "PortRegistry";

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "ENVPORT_CONFIG";

/// File names searched for in the working directory
pub const CONFIG_FILE_NAMES: [&str; 2] = ["envport.yaml", ".envport.yaml"];

/// envport.yaml file structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvPortConfig {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub spec: ConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSpec {
    #[serde(default = "builtin_environments")]
    pub environments: Vec<Environment>,
    #[serde(default = "default_reserved_ranges")]
    pub reserved_ranges: Vec<ReservedRange>,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub severity: SeverityPolicy,
    /// Owner name patterns per service; replaces the built-in patterns of the listed services
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub allow_list: BTreeMap<ServiceName, Vec<String>>,
}

impl Default for ConfigSpec {
    fn default() -> Self {
        ConfigSpec {
            environments: builtin_environments(),
            reserved_ranges: default_reserved_ranges(),
            probe: ProbeConfig::default(),
            monitor: MonitorConfig::default(),
            scoring: ScoringConfig::default(),
            severity: SeverityPolicy::default(),
            allow_list: BTreeMap::new(),
        }
    }
}

/// Occupancy probing limits
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProbeConfig {
    pub timeout_ms: u64,
    pub concurrency: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            timeout_ms: 1000,
            concurrency: 32,
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Monitor loop tuning
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorConfig {
    pub interval_ms: u64,
    /// Maximum retained events; oldest are evicted first
    pub history_limit: usize,
    /// Consecutive agreeing polls needed before a port flips state
    pub debounce_polls: u32,
    /// Polls a port first seen occupied may stay conflicted before alerting
    pub grace_polls: u32,
    /// Consecutive conflicted polls before an alert becomes critical
    pub escalate_after: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            interval_ms: 5000,
            history_limit: 1000,
            debounce_polls: 2,
            grace_polls: 3,
            escalate_after: 5,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Suggestion scoring and reassignment limits
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ScoringConfig {
    pub candidate_pool: usize,
    /// Suggestions re-probed before a reassignment is declared failed
    pub max_attempts: usize,
    pub weights: ScoreWeights,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        ScoringConfig {
            candidate_pool: 256,
            max_attempts: 3,
            weights: ScoreWeights::default(),
        }
    }
}

fn default_api_version() -> String {
    API_VERSION.to_string()
}

fn default_kind() -> String {
    KIND.to_string()
}

fn builtin_environments() -> Vec<Environment> {
    EnvironmentId::ALL.iter().map(|id| Environment::builtin(*id)).collect()
}

impl Default for EnvPortConfig {
    fn default() -> Self {
        EnvPortConfig {
            api_version: default_api_version(),
            kind: default_kind(),
            spec: ConfigSpec::default(),
        }
    }
}

impl EnvPortConfig {
    /// Load envport.yaml from specified path
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).map_err(|e| {
            EnvPortError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: EnvPortConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Search for a config file: $ENVPORT_CONFIG, then envport.yaml / .envport.yaml in `start_dir`
    ///
    /// Returns `None` when nothing is found; callers fall back to defaults.
    pub fn discover(start_dir: &Path) -> Result<Option<(PathBuf, Self)>> {
        if let Ok(explicit) = env::var(CONFIG_ENV_VAR) {
            if !explicit.is_empty() {
                let path = PathBuf::from(explicit);
                let config = Self::load(&path)?;
                return Ok(Some((path, config)));
            }
        }

        for name in CONFIG_FILE_NAMES {
            let candidate = start_dir.join(name);
            if candidate.exists() {
                let config = Self::load(&candidate)?;
                return Ok(Some((candidate, config)));
            }
        }

        Ok(None)
    }

    /// Validate envelope and tuning values
    ///
    /// Environment contents (out-of-range ports, duplicates) are not errors here;
    /// they surface as registry issues and detector conflicts.
    pub fn validate(&self) -> Result<()> {
        if self.api_version != API_VERSION {
            return Err(EnvPortError::Config(format!(
                "Invalid apiVersion: expected '{}', got '{}'",
                API_VERSION, self.api_version
            )));
        }

        if self.kind != KIND {
            return Err(EnvPortError::Config(format!(
                "Invalid kind: expected '{}', got '{}'",
                KIND, self.kind
            )));
        }

        if self.spec.environments.is_empty() {
            return Err(EnvPortError::Config(
                "spec.environments cannot be empty".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for environment in &self.spec.environments {
            if !seen.insert(environment.id) {
                return Err(EnvPortError::Config(format!(
                    "Environment '{}' declared more than once",
                    environment.id
                )));
            }
            if environment.range.start >= environment.range.end {
                return Err(EnvPortError::Config(format!(
                    "Environment '{}' has invalid range {}",
                    environment.id, environment.range
                )));
            }
        }

        for reserved in &self.spec.reserved_ranges {
            if reserved.start > reserved.end {
                return Err(EnvPortError::Config(format!(
                    "Reserved range '{}' has start above end",
                    reserved.description
                )));
            }
        }

        if self.spec.probe.concurrency == 0 {
            return Err(EnvPortError::Config(
                "probe.concurrency must be at least 1".to_string(),
            ));
        }

        if self.spec.probe.concurrency > Semaphore::MAX_PERMITS {
            return Err(EnvPortError::Config(format!(
                "probe.concurrency must not exceed {}",
                Semaphore::MAX_PERMITS
            )));
        }

        if self.spec.monitor.interval_ms == 0 {
            return Err(EnvPortError::Config(
                "monitor.intervalMs must be at least 1".to_string(),
            ));
        }

        if self.spec.monitor.debounce_polls == 0 {
            return Err(EnvPortError::Config(
                "monitor.debouncePolls must be at least 1".to_string(),
            ));
        }

        if self.spec.monitor.history_limit == 0 {
            return Err(EnvPortError::Config(
                "monitor.historyLimit must be at least 1".to_string(),
            ));
        }

        // Suggestion scores are read as percentages
        let total = self.spec.scoring.weights.total();
        if total != 100 {
            return Err(EnvPortError::Config(format!(
                "scoring.weights must sum to 100, got {}",
                total
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path.as_ref(), yaml).map_err(|e| {
            EnvPortError::Config(format!(
                "Failed to write {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Ok(())
    }
}
