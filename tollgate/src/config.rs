//! Engine configuration.
//!
//! Loaded from JSON with every field optional, then overridden by
//! `TOLLGATE_*` environment variables.

use crate::artifacts::MissingArtifactPolicy;
use crate::errors::{ConfigurationError, TollgateError};
use crate::pipeline::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Which sandbox adapter steps run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxKind {
    /// Host processes; the image is recorded only.
    #[default]
    Process,
    /// Containers through the docker CLI.
    Docker,
}

impl FromStr for SandboxKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "process" => Ok(Self::Process),
            "docker" => Ok(Self::Docker),
            other => Err(format!("unknown sandbox '{other}'")),
        }
    }
}

/// Configuration for the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Sandbox adapter.
    #[serde(default)]
    pub sandbox: SandboxKind,
    /// Concurrently held sandboxes.
    #[serde(default = "default_sandbox_slots")]
    pub sandbox_slots: usize,
    /// Callers allowed to wait for a slot before acquisition fails.
    #[serde(default = "default_queue_depth")]
    pub sandbox_queue_depth: usize,
    /// Retry policy for sandbox acquisition.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Seconds between the terminate signal and the forced kill.
    #[serde(default = "default_grace_secs")]
    pub termination_grace_secs: u64,
    /// Timeout for steps that declare none.
    #[serde(default)]
    pub default_step_timeout_secs: Option<u64>,
    /// Severity of artifact rules that match nothing.
    #[serde(default)]
    pub missing_artifact_policy: MissingArtifactPolicy,
    /// Concurrently executing runs per orchestration.
    #[serde(default = "default_max_parallel_runs")]
    pub max_parallel_runs: usize,
    /// Directory for artifact content; in-memory storage when unset.
    #[serde(default)]
    pub artifact_root: Option<PathBuf>,
    /// Directory checkout directories are created in.
    #[serde(default = "default_work_root")]
    pub work_root: PathBuf,
    /// Reuse the latest successful dependency run on the same branch.
    #[serde(default = "default_reuse")]
    pub reuse_successful_runs: bool,
    /// Keep artifacts, run snapshots and logs of only this many newest runs
    /// per build.
    #[serde(default)]
    pub artifact_retention: Option<usize>,
}

fn default_sandbox_slots() -> usize {
    4
}

fn default_queue_depth() -> usize {
    64
}

fn default_grace_secs() -> u64 {
    10
}

fn default_max_parallel_runs() -> usize {
    4
}

fn default_work_root() -> PathBuf {
    PathBuf::from("work")
}

fn default_reuse() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxKind::default(),
            sandbox_slots: default_sandbox_slots(),
            sandbox_queue_depth: default_queue_depth(),
            retry: RetryPolicy::default(),
            termination_grace_secs: default_grace_secs(),
            default_step_timeout_secs: None,
            missing_artifact_policy: MissingArtifactPolicy::default(),
            max_parallel_runs: default_max_parallel_runs(),
            artifact_root: None,
            work_root: default_work_root(),
            reuse_successful_runs: default_reuse(),
            artifact_retention: None,
        }
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigurationError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigurationError::new(format!("{name}: invalid value '{value}'")))
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::Serialization`] for malformed JSON.
    pub fn from_json_str(json: &str) -> Result<Self, TollgateError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an IO or serialization error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TollgateError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Applies `TOLLGATE_*` variables from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] for an unparsable value.
    pub fn with_env_overrides(self) -> Result<Self, ConfigurationError> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Applies `TOLLGATE_*` variables read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] for an unparsable value.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("TOLLGATE_SANDBOX") {
            self.sandbox = v
                .parse()
                .map_err(|e: String| ConfigurationError::new(format!("TOLLGATE_SANDBOX: {e}")))?;
        }
        if let Some(v) = var("TOLLGATE_SANDBOX_SLOTS") {
            self.sandbox_slots = parse_var("TOLLGATE_SANDBOX_SLOTS", &v)?;
        }
        if let Some(v) = var("TOLLGATE_SANDBOX_QUEUE_DEPTH") {
            self.sandbox_queue_depth = parse_var("TOLLGATE_SANDBOX_QUEUE_DEPTH", &v)?;
        }
        if let Some(v) = var("TOLLGATE_RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_var("TOLLGATE_RETRY_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = var("TOLLGATE_RETRY_BASE_DELAY_MS") {
            self.retry.base_delay_ms = parse_var("TOLLGATE_RETRY_BASE_DELAY_MS", &v)?;
        }
        if let Some(v) = var("TOLLGATE_GRACE_SECS") {
            self.termination_grace_secs = parse_var("TOLLGATE_GRACE_SECS", &v)?;
        }
        if let Some(v) = var("TOLLGATE_STEP_TIMEOUT_SECS") {
            self.default_step_timeout_secs = Some(parse_var("TOLLGATE_STEP_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = var("TOLLGATE_MISSING_ARTIFACTS") {
            self.missing_artifact_policy = match v.trim().to_ascii_lowercase().as_str() {
                "warn" => MissingArtifactPolicy::Warn,
                "fail" => MissingArtifactPolicy::Fail,
                _ => {
                    return Err(ConfigurationError::new(format!(
                        "TOLLGATE_MISSING_ARTIFACTS: expected warn or fail, got '{v}'"
                    )))
                }
            };
        }
        if let Some(v) = var("TOLLGATE_MAX_PARALLEL_RUNS") {
            self.max_parallel_runs = parse_var("TOLLGATE_MAX_PARALLEL_RUNS", &v)?;
        }
        if let Some(v) = var("TOLLGATE_ARTIFACT_ROOT") {
            self.artifact_root = Some(PathBuf::from(v));
        }
        if let Some(v) = var("TOLLGATE_WORK_ROOT") {
            self.work_root = PathBuf::from(v);
        }
        if let Some(v) = var("TOLLGATE_REUSE_RUNS") {
            self.reuse_successful_runs = parse_var("TOLLGATE_REUSE_RUNS", &v)?;
        }
        if let Some(v) = var("TOLLGATE_ARTIFACT_RETENTION") {
            self.artifact_retention = Some(parse_var("TOLLGATE_ARTIFACT_RETENTION", &v)?);
        }
        Ok(self)
    }

    /// Termination grace period.
    #[must_use]
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_secs)
    }

    /// Default step timeout.
    #[must_use]
    pub fn default_step_timeout(&self) -> Option<Duration> {
        self.default_step_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::BackoffStrategy;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.sandbox, SandboxKind::Process);
        assert_eq!(config.sandbox_slots, 4);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.backoff, BackoffStrategy::Exponential);
        assert_eq!(config.grace(), Duration::from_secs(10));
        assert!(config.default_step_timeout().is_none());
        assert!(config.reuse_successful_runs);
    }

    #[test]
    fn test_partial_json() {
        let config = EngineConfig::from_json_str(
            r#"{"sandbox": "docker", "sandbox_slots": 2, "retry": {"max_attempts": 5}, "missing_artifact_policy": "fail"}"#,
        )
        .unwrap();

        assert_eq!(config.sandbox, SandboxKind::Docker);
        assert_eq!(config.sandbox_slots, 2);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(config.missing_artifact_policy, MissingArtifactPolicy::Fail);
        assert_eq!(config.max_parallel_runs, 4);
    }

    #[test]
    fn test_env_overrides() {
        let vars = HashMap::from([
            ("TOLLGATE_SANDBOX_SLOTS", "8"),
            ("TOLLGATE_STEP_TIMEOUT_SECS", "600"),
            ("TOLLGATE_MISSING_ARTIFACTS", "FAIL"),
            ("TOLLGATE_REUSE_RUNS", "false"),
            ("TOLLGATE_WORK_ROOT", ""),
        ]);
        let config = EngineConfig::default()
            .with_overrides(|name| vars.get(name).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(config.sandbox_slots, 8);
        assert_eq!(config.default_step_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.missing_artifact_policy, MissingArtifactPolicy::Fail);
        assert!(!config.reuse_successful_runs);
        assert_eq!(config.work_root, PathBuf::from("work"));
    }

    #[test]
    fn test_bad_override_is_rejected() {
        let err = EngineConfig::default()
            .with_overrides(|name| (name == "TOLLGATE_SANDBOX_SLOTS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("TOLLGATE_SANDBOX_SLOTS"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"max_parallel_runs": 1}"#).unwrap();

        assert_eq!(EngineConfig::from_file(&path).unwrap().max_parallel_runs, 1);
        assert!(EngineConfig::from_file(dir.path().join("missing.json")).is_err());
    }
}
