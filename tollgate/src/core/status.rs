//! Run and step status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle status of a build run.
///
/// `Pending → Running → {Success, Failed, Cancelled}`. A pending run may
/// also go straight to `Failed` (a dependency failed) or `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Queued, not yet started.
    #[default]
    Pending,
    /// Steps are executing.
    Running,
    /// Every required step succeeded.
    Success,
    /// A required step, a dependency or artifact publication failed.
    Failed,
    /// The run was cancelled.
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl RunStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    /// Returns true if `next` is a legal successor of this status.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Failed | Self::Cancelled),
            Self::Running => next.is_terminal(),
            Self::Success | Self::Failed | Self::Cancelled => false,
        }
    }
}

/// The outcome of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// The command exited with code 0.
    Success,
    /// The command exited non-zero or the sandbox failed.
    Failed,
    /// The step condition evaluated false.
    Skipped,
    /// The step exceeded its timeout.
    TimedOut,
    /// The run was cancelled while the step executed.
    Cancelled,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl StepStatus {
    /// Returns true if the step does not block the run.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_display() {
        assert_eq!(RunStatus::Pending.to_string(), "pending");
        assert_eq!(RunStatus::Success.to_string(), "success");
        assert_eq!(RunStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_run_status_is_terminal() {
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn test_run_status_transitions() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Success));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Cancelled));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Pending));
        assert!(!RunStatus::Success.can_transition_to(RunStatus::Failed));
    }

    #[test]
    fn test_step_status_serialize() {
        let json = serde_json::to_string(&StepStatus::TimedOut).unwrap();
        assert_eq!(json, r#""timed_out""#);

        let back: StepStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, StepStatus::TimedOut);
        assert!(StepStatus::Skipped.is_success());
        assert!(!StepStatus::Cancelled.is_success());
    }
}
