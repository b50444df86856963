//! Lifecycle events emitted while runs execute.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use crate::core::{BuildRun, StepResult};
use crate::utils::elapsed_ms;
use serde_json::{json, Value};

/// Event type names.
pub mod names {
    /// A run was created in `Pending`.
    pub const RUN_CREATED: &str = "run.created";
    /// A run moved to `Running`.
    pub const RUN_STARTED: &str = "run.started";
    /// A run reached a terminal status.
    pub const RUN_FINISHED: &str = "run.finished";
    /// A step produced a result.
    pub const STEP_FINISHED: &str = "step.finished";
    /// A run published artifacts.
    pub const ARTIFACTS_PUBLISHED: &str = "artifacts.published";
    /// Artifacts were copied from an upstream run.
    pub const ARTIFACTS_COPIED: &str = "artifacts.copied";
    /// A trigger enqueued a run request.
    pub const TRIGGER_FIRED: &str = "trigger.fired";
}

/// Event payload describing a run.
#[must_use]
pub fn run_payload(run: &BuildRun) -> Value {
    json!({
        "run_id": run.id.to_string(),
        "build_id": run.build_id,
        "build_number": run.build_number,
        "branch": run.branch,
        "status": run.status.to_string(),
        "failure": run.failure.as_ref().map(|f| f.code.clone()),
        "duration_ms": run.started_at.zip(run.finished_at).map(|(start, end)| elapsed_ms(start, end)),
    })
}

/// Event payload describing a step result.
#[must_use]
pub fn step_payload(run: &BuildRun, step: &StepResult) -> Value {
    json!({
        "run_id": run.id.to_string(),
        "build_id": run.build_id,
        "step_id": step.step_id,
        "status": step.status.to_string(),
        "exit_code": step.exit_code,
        "attempts": step.attempts,
    })
}
