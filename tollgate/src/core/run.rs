//! Build runs, step results and run requests.

use super::{Artifact, BuildId, RunStatus, StepStatus};
use crate::errors::TransitionError;
use crate::utils::{now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Reference to captured step output in the [`LogStore`](crate::step::LogStore).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogRef(pub String);

impl LogRef {
    /// The reference for a step of a run.
    #[must_use]
    pub fn for_step(run_id: Uuid, step_id: &str) -> Self {
        Self(format!("{run_id}/{step_id}"))
    }
}

impl fmt::Display for LogRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of one step of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    /// The step id.
    pub step_id: String,
    /// Outcome.
    pub status: StepStatus,
    /// Process exit code, when the command ran to completion.
    pub exit_code: Option<i32>,
    /// Captured output.
    pub log_ref: Option<LogRef>,
    /// Sandbox acquisition attempts.
    pub attempts: u32,
    /// Human-readable reason for skipped or failed steps.
    pub message: Option<String>,
    /// When the step started.
    pub started_at: Timestamp,
    /// When the step finished.
    pub finished_at: Timestamp,
}

impl StepResult {
    /// A step whose condition evaluated false.
    #[must_use]
    pub fn skipped(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let now = now_utc();
        Self {
            step_id: step_id.into(),
            status: StepStatus::Skipped,
            exit_code: None,
            log_ref: None,
            attempts: 0,
            message: Some(reason.into()),
            started_at: now,
            finished_at: now,
        }
    }
}

/// Why a run ended in `Failed` (or why it was cancelled).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    /// Failing step, if a step caused it.
    pub step_id: Option<String>,
    /// Machine-readable reason.
    pub code: String,
    /// Description.
    pub message: String,
    /// Captured output of the failing step.
    pub log_ref: Option<LogRef>,
}

impl RunFailure {
    /// Creates a failure record not tied to a step.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step_id: None,
            code: code.into(),
            message: message.into(),
            log_ref: None,
        }
    }

    /// Ties the failure to a step and its output.
    #[must_use]
    pub fn at_step(mut self, step_id: impl Into<String>, log_ref: Option<LogRef>) -> Self {
        self.step_id = Some(step_id.into());
        self.log_ref = log_ref;
        self
    }
}

/// What caused a run to be enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerCause {
    /// Started by hand.
    Manual,
    /// A commit on the VCS root.
    Vcs {
        /// Commit revision.
        revision: String,
    },
    /// An upstream run finished.
    FinishedBuild {
        /// Upstream build.
        upstream: BuildId,
        /// Upstream run.
        run_id: Uuid,
    },
    /// Started to satisfy a dependent build.
    Dependency {
        /// The build that needs this one.
        dependent: BuildId,
    },
}

/// A request to run a build, as produced by triggers or manual invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    /// The build to run.
    pub build_id: BuildId,
    /// Logical branch name.
    pub branch: String,
    /// Whether `branch` is the VCS root's default branch.
    pub is_default_branch: bool,
    /// Why the run is requested.
    pub cause: TriggerCause,
    /// Run-scoped parameter overrides.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl RunRequest {
    /// A manual request.
    #[must_use]
    pub fn manual(build_id: impl Into<BuildId>, branch: impl Into<String>, is_default_branch: bool) -> Self {
        Self {
            build_id: build_id.into(),
            branch: branch.into(),
            is_default_branch,
            cause: TriggerCause::Manual,
            parameters: BTreeMap::new(),
        }
    }

    /// Adds a run-scoped parameter.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// The same branch and parameters for another build.
    #[must_use]
    pub fn for_dependency(&self, build_id: &str, dependent: &str) -> Self {
        Self {
            build_id: build_id.to_string(),
            branch: self.branch.clone(),
            is_default_branch: self.is_default_branch,
            cause: TriggerCause::Dependency {
                dependent: dependent.to_string(),
            },
            parameters: self.parameters.clone(),
        }
    }

    /// Returns true if both requests would produce an equivalent run.
    #[must_use]
    pub fn is_equivalent(&self, other: &Self) -> bool {
        self.build_id == other.build_id
            && self.branch == other.branch
            && self.parameters == other.parameters
    }
}

/// One execution of a build definition.
///
/// Only the scheduler that owns a run mutates it; once the status is
/// terminal every mutator returns a [`TransitionError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRun {
    /// Run id.
    pub id: Uuid,
    /// Build definition id.
    pub build_id: BuildId,
    /// Per-build sequence number.
    pub build_number: u64,
    /// Logical branch.
    pub branch: String,
    /// Whether `branch` is the default branch.
    pub is_default_branch: bool,
    /// Current status.
    pub status: RunStatus,
    /// Step results in execution order.
    pub steps: Vec<StepResult>,
    /// Artifacts published by or copied into this run.
    pub artifacts: Vec<Artifact>,
    /// Run-scoped parameters.
    pub parameters: BTreeMap<String, String>,
    /// Checkout directory steps run in.
    pub checkout_dir: PathBuf,
    /// Why the run exists.
    pub cause: TriggerCause,
    /// Failure or cancellation record.
    pub failure: Option<RunFailure>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Start time.
    pub started_at: Option<Timestamp>,
    /// End time.
    pub finished_at: Option<Timestamp>,
}

impl BuildRun {
    /// Creates a pending run for a request.
    #[must_use]
    pub fn new(request: &RunRequest, build_number: u64, checkout_dir: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            build_id: request.build_id.clone(),
            build_number,
            branch: request.branch.clone(),
            is_default_branch: request.is_default_branch,
            status: RunStatus::Pending,
            steps: Vec::new(),
            artifacts: Vec::new(),
            parameters: request.parameters.clone(),
            checkout_dir,
            cause: request.cause.clone(),
            failure: None,
            created_at: now_utc(),
            started_at: None,
            finished_at: None,
        }
    }

    fn transition(&mut self, to: RunStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                run_id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    fn guard_mutable(&self) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError {
                run_id: self.id,
                from: self.status,
                to: self.status,
            });
        }
        Ok(())
    }

    /// `Pending → Running`.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(RunStatus::Running)?;
        self.started_at = Some(now_utc());
        Ok(())
    }

    /// `Running → Success | Failed | Cancelled`.
    pub fn finish(&mut self, status: RunStatus) -> Result<(), TransitionError> {
        if self.status != RunStatus::Running || !status.is_terminal() {
            return Err(TransitionError {
                run_id: self.id,
                from: self.status,
                to: status,
            });
        }
        self.status = status;
        self.finished_at = Some(now_utc());
        Ok(())
    }

    /// `Pending → Failed` without running any step.
    pub fn fail_to_start(&mut self, failure: RunFailure) -> Result<(), TransitionError> {
        if self.status != RunStatus::Pending {
            return Err(TransitionError {
                run_id: self.id,
                from: self.status,
                to: RunStatus::Failed,
            });
        }
        self.status = RunStatus::Failed;
        self.failure = Some(failure);
        self.finished_at = Some(now_utc());
        Ok(())
    }

    /// `Pending → Cancelled` without running any step.
    pub fn cancel_pending(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        if self.status != RunStatus::Pending {
            return Err(TransitionError {
                run_id: self.id,
                from: self.status,
                to: RunStatus::Cancelled,
            });
        }
        self.status = RunStatus::Cancelled;
        self.failure = Some(RunFailure::new("cancelled", reason));
        self.finished_at = Some(now_utc());
        Ok(())
    }

    /// Appends a step result to a running run.
    pub fn record_step(&mut self, result: StepResult) -> Result<(), TransitionError> {
        if self.status != RunStatus::Running {
            return Err(TransitionError {
                run_id: self.id,
                from: self.status,
                to: RunStatus::Running,
            });
        }
        self.steps.push(result);
        Ok(())
    }

    /// Records the failure reason of a non-terminal run.
    pub fn record_failure(&mut self, failure: RunFailure) -> Result<(), TransitionError> {
        self.guard_mutable()?;
        self.failure = Some(failure);
        Ok(())
    }

    /// Adds artifacts to a non-terminal run.
    pub fn add_artifacts(&mut self, artifacts: Vec<Artifact>) -> Result<(), TransitionError> {
        self.guard_mutable()?;
        for artifact in artifacts {
            self.artifacts.retain(|a| a.path != artifact.path);
            self.artifacts.push(artifact);
        }
        Ok(())
    }

    /// Looks up the result of a step.
    #[must_use]
    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}
