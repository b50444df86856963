//! Error types for the tollgate engine.
//!
//! Registration problems surface as [`ConfigurationError`] before any run
//! starts. Everything that can go wrong while a run is in flight is folded
//! into [`TollgateError`] through `#[from]` conversions.

use crate::artifacts::ArtifactError;
use crate::core::RunStatus;
use crate::sandbox::SandboxError;
use crate::step::StepError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// The main error type for tollgate operations.
#[derive(Debug, Error)]
pub enum TollgateError {
    /// A build definition failed validation.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// The dependency graph of a target contains a cycle.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// A step could not be completed.
    #[error("{0}")]
    Step(#[from] StepError),

    /// The execution sandbox reported an error.
    #[error("{0}")]
    Sandbox(#[from] SandboxError),

    /// Artifact storage reported an error.
    #[error("{0}")]
    Artifact(#[from] ArtifactError),

    /// A `%name%` reference could not be resolved.
    #[error("{0}")]
    Parameter(#[from] ParameterError),

    /// A run was asked to move to a status it cannot reach.
    #[error("{0}")]
    Transition(#[from] TransitionError),

    /// The requested build id is not registered.
    #[error("Unknown build: {0}")]
    UnknownBuild(String),

    /// The requested run id is unknown.
    #[error("Unknown run: {0}")]
    UnknownRun(Uuid),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Diagnostic metadata attached to validation errors.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Error code (e.g., "CONFIG-001-MISSING_STEP").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Validation codes used by [`ConfigurationError`].
pub mod codes {
    /// A `steps_order` entry names a step that does not exist.
    pub const MISSING_STEP: &str = "CONFIG-001-MISSING_STEP";
    /// Two steps of one build share an id.
    pub const DUPLICATE_STEP: &str = "CONFIG-002-DUPLICATE_STEP";
    /// A dependency or trigger names an unregistered build.
    pub const UNKNOWN_BUILD: &str = "CONFIG-003-UNKNOWN_BUILD";
    /// A build attaches a template that does not exist.
    pub const UNKNOWN_TEMPLATE: &str = "CONFIG-004-UNKNOWN_TEMPLATE";
    /// A build or trigger needs a VCS root that does not exist.
    pub const UNKNOWN_VCS_ROOT: &str = "CONFIG-005-UNKNOWN_VCS_ROOT";
    /// A composite build declares steps.
    pub const COMPOSITE_STEPS: &str = "CONFIG-006-COMPOSITE_STEPS";
    /// Two builds, templates or roots share an id.
    pub const DUPLICATE_ID: &str = "CONFIG-007-DUPLICATE_ID";
    /// An id is empty or whitespace-only.
    pub const EMPTY_ID: &str = "CONFIG-008-EMPTY_ID";
    /// An artifact rule string is malformed.
    pub const INVALID_RULE: &str = "CONFIG-009-INVALID_RULE";
    /// A branch specification is malformed.
    pub const INVALID_BRANCH_SPEC: &str = "CONFIG-010-INVALID_BRANCH_SPEC";
    /// A build depends on itself.
    pub const SELF_DEPENDENCY: &str = "CONFIG-011-SELF_DEPENDENCY";
    /// Finished-build triggers fire each other in a loop.
    pub const TRIGGER_CYCLE: &str = "CONFIG-012-TRIGGER_CYCLE";
    /// A dependency graph contains a cycle.
    pub const CYCLE: &str = "GRAPH-001-CYCLE";
}

/// Error raised when a project or build definition fails validation.
///
/// Only produced while a project is being registered, never mid-run.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConfigurationError {
    /// The error message.
    pub message: String,
    /// The build the error refers to, when there is one.
    pub build: Option<String>,
    /// Diagnostic info.
    pub error_info: Option<ErrorInfo>,
}

impl ConfigurationError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            build: None,
            error_info: None,
        }
    }

    /// Creates an error with a code and a summary in one go.
    #[must_use]
    pub fn coded(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(message.clone()).with_error_info(ErrorInfo::new(code, message))
    }

    /// Sets the build involved.
    #[must_use]
    pub fn for_build(mut self, build: impl Into<String>) -> Self {
        self.build = Some(build.into());
        self
    }

    /// Sets the diagnostic info.
    #[must_use]
    pub fn with_error_info(mut self, info: ErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the diagnostic code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}

/// Error raised when a cycle is detected in the build dependency graph.
#[derive(Debug, Clone, Error)]
#[error("Dependency cycle detected: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The builds forming the cycle; the first id is repeated at the end.
    pub cycle_path: Vec<String>,
    /// Diagnostic info.
    pub error_info: ErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ErrorInfo::new(
            codes::CYCLE,
            format!("Build dependencies form a cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one snapshot or artifact dependency in the cycle.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

/// Error raised while substituting `%name%` references.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParameterError {
    /// No scope defines the parameter.
    #[error("Unresolved parameter reference: %{name}%")]
    Unresolved {
        /// The parameter name.
        name: String,
    },

    /// Parameter values reference each other in a loop.
    #[error("Parameter reference cycle: {}", chain.join(" -> "))]
    Cycle {
        /// The chain of names, first name repeated at the end.
        chain: Vec<String>,
    },
}

/// Error raised when a run is asked to make a transition its state machine forbids.
#[derive(Debug, Clone, Error)]
#[error("Run {run_id}: illegal transition {from} -> {to}")]
pub struct TransitionError {
    /// The run.
    pub run_id: Uuid,
    /// The current status.
    pub from: RunStatus,
    /// The requested status.
    pub to: RunStatus,
}
