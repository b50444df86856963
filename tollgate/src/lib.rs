//! # Tollgate
//!
//! A CI/CD pipeline orchestration engine.
//!
//! Tollgate takes a project of declarative build definitions and runs them:
//!
//! - **Dependency resolution**: snapshot and artifact dependencies are resolved
//!   into a deterministic execution order, cycles are rejected with their path
//! - **Sandboxed steps**: every step runs in an isolated environment with
//!   parameter substitution, timeouts and secret masking
//! - **Artifact propagation**: outputs are published by rules and copied into
//!   dependent builds
//! - **Triggers**: VCS changes and finished builds enqueue new runs
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tollgate::prelude::*;
//!
//! let project = Project::from_json(&std::fs::read_to_string("project.json")?)?;
//! let engine = Engine::builder(project).config(EngineConfig::default()).build()?;
//!
//! let report = engine.run(RunRequest::manual("General", "main", true)).await?;
//! assert!(report.is_success());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod artifacts;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod engine;
pub mod errors;
pub mod events;
pub mod observability;
pub mod orchestrator;
pub mod params;
pub mod pipeline;
pub mod sandbox;
pub mod step;
pub mod triggers;
pub mod utils;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::artifacts::{
        ArtifactRules, ArtifactStore, FsArtifactStore, InMemoryArtifactStore, MissingArtifactPolicy,
    };
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{EngineConfig, SandboxKind};
    pub use crate::core::{
        Artifact, BuildDefinition, BuildRun, Condition, Dependency, ExecutionEnvironment, Project,
        PublishMode, RunRequest, RunStatus, StepDefinition, StepStatus, TriggerDefinition, VcsRoot,
    };
    pub use crate::engine::{Engine, EngineBuilder};
    pub use crate::errors::{ConfigurationError, CycleDetectedError, TollgateError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::orchestrator::{BuildOrchestrator, OrchestrationReport};
    pub use crate::params::{MapSecretStore, ParameterResolver, SecretStore};
    pub use crate::pipeline::{resolve, PipelineScheduler, RetryPolicy};
    pub use crate::sandbox::{DockerSandbox, ExecutionSandbox, ProcessSandbox, SandboxPool};
    pub use crate::step::StepExecutor;
    pub use crate::triggers::{BranchSpec, TriggerEngine, TriggerEvent};
}
