//! Core domain model: build definitions, projects, runs and statuses.

mod artifact;
mod condition;
mod definition;
mod project;
mod run;
mod status;

pub use artifact::Artifact;
pub use condition::{Condition, ConditionAtom};
pub use definition::{
    BuildDefinition, BuildId, BuildType, Dependency, DependencyKind, ExecutionEnvironment,
    PublishMode, StepDefinition, StepKind, TriggerDefinition,
};
pub use project::{BuildTemplate, Project, ProjectBuilder, ProjectDocument, VcsRoot};
pub use run::{BuildRun, LogRef, RunFailure, RunRequest, StepResult, TriggerCause};
pub use status::{RunStatus, StepStatus};
