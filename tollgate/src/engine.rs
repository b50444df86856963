//! Wiring of sandbox, stores, scheduler, triggers and orchestrator.

use crate::artifacts::{ArtifactStore, FsArtifactStore, InMemoryArtifactStore};
use crate::config::{EngineConfig, SandboxKind};
use crate::core::{Project, RunRequest};
use crate::errors::TollgateError;
use crate::events::{EventSink, LoggingEventSink};
use crate::orchestrator::{BuildOrchestrator, OrchestrationReport};
use crate::params::{ParameterResolver, SecretStore};
use crate::pipeline::{PipelineScheduler, RunStore};
use crate::sandbox::{DockerSandbox, ExecutionSandbox, ProcessSandbox, SandboxPool};
use crate::step::{LogStore, StepExecutor};
use crate::triggers::{TriggerEngine, TriggerEvent};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Builder for [`Engine`].
pub struct EngineBuilder {
    project: Project,
    config: EngineConfig,
    sandbox: Option<Arc<dyn ExecutionSandbox>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    events: Option<Arc<dyn EventSink>>,
    secrets: Option<Arc<dyn SecretStore>>,
    parameters: Option<ParameterResolver>,
    process_env: bool,
}

impl EngineBuilder {
    fn new(project: Project) -> Self {
        Self {
            project,
            config: EngineConfig::default(),
            sandbox: None,
            artifacts: None,
            events: None,
            secrets: None,
            parameters: None,
            process_env: true,
        }
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses a specific sandbox instead of the configured adapter.
    #[must_use]
    pub fn sandbox(mut self, sandbox: Arc<dyn ExecutionSandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// Uses a specific artifact store.
    #[must_use]
    pub fn artifacts(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Sets the event sink. Defaults to [`LoggingEventSink`].
    #[must_use]
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Sets the secret store consulted for unresolved parameters.
    #[must_use]
    pub fn secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Uses `parameters` as the base resolver instead of capturing the
    /// process environment.
    #[must_use]
    pub fn parameters(mut self, parameters: ParameterResolver) -> Self {
        self.parameters = Some(parameters);
        self
    }

    /// Whether `env.*` parameters see the process environment.
    #[must_use]
    pub fn process_env(mut self, enabled: bool) -> Self {
        self.process_env = enabled;
        self
    }

    /// Assembles the engine.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the trigger watch list cannot be built.
    pub fn build(self) -> Result<Engine, TollgateError> {
        let config = self.config;
        let sandbox: Arc<dyn ExecutionSandbox> = match (self.sandbox, config.sandbox) {
            (Some(sandbox), _) => sandbox,
            (None, SandboxKind::Process) => Arc::new(ProcessSandbox::new()),
            (None, SandboxKind::Docker) => Arc::new(DockerSandbox::new()),
        };
        let artifacts: Arc<dyn ArtifactStore> = match (self.artifacts, &config.artifact_root) {
            (Some(artifacts), _) => artifacts,
            (None, Some(root)) => Arc::new(FsArtifactStore::new(root.clone())),
            (None, None) => Arc::new(InMemoryArtifactStore::new()),
        };
        let events: Arc<dyn EventSink> = match self.events {
            Some(events) => events,
            None => Arc::new(LoggingEventSink::default()),
        };

        let mut params = match self.parameters {
            Some(params) => params,
            None if self.process_env => ParameterResolver::new().with_process_env(),
            None => ParameterResolver::new(),
        };
        if let Some(secrets) = self.secrets {
            params = params.with_secrets(secrets);
        }

        let pool = Arc::new(SandboxPool::new(sandbox, config.sandbox_slots, config.sandbox_queue_depth));
        let executor = StepExecutor::new(pool, Arc::new(LogStore::new()))
            .with_retry(config.retry.clone())
            .with_grace(config.grace())
            .with_default_timeout(config.default_step_timeout());
        let scheduler = Arc::new(
            PipelineScheduler::new(executor, artifacts, Arc::new(RunStore::new()), events.clone(), config.work_root.clone())
                .with_parameters(params)
                .with_missing_artifact_policy(config.missing_artifact_policy)
                .with_retention(config.artifact_retention),
        );

        let project = Arc::new(self.project);
        let triggers = Arc::new(TriggerEngine::new(&project)?.with_events(events));
        let orchestrator = BuildOrchestrator::new(Arc::clone(&project), Arc::clone(&scheduler))
            .with_max_parallel(config.max_parallel_runs)
            .with_reuse(config.reuse_successful_runs)
            .with_triggers(Arc::clone(&triggers));

        info!(
            project = %project.id(),
            builds = project.builds().count(),
            sandbox = ?config.sandbox,
            slots = config.sandbox_slots,
            "Engine ready"
        );
        Ok(Engine {
            config,
            project,
            scheduler,
            triggers,
            orchestrator,
        })
    }
}

/// A fully wired engine for one project.
pub struct Engine {
    config: EngineConfig,
    project: Arc<Project>,
    scheduler: Arc<PipelineScheduler>,
    triggers: Arc<TriggerEngine>,
    orchestrator: BuildOrchestrator,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("project", &self.project.id())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Starts building an engine for a validated project.
    #[must_use]
    pub fn builder(project: Project) -> EngineBuilder {
        EngineBuilder::new(project)
    }

    /// Runs a build with its dependency closure.
    ///
    /// # Errors
    ///
    /// See [`BuildOrchestrator::run`].
    pub async fn run(&self, request: RunRequest) -> Result<OrchestrationReport, TollgateError> {
        self.orchestrator.run(request).await
    }

    /// Puts an external event into the trigger inbox.
    pub fn submit(&self, event: TriggerEvent) {
        self.triggers.submit(event);
    }

    /// Processes triggers and runs everything they queue.
    ///
    /// # Errors
    ///
    /// See [`BuildOrchestrator::drain_queue`].
    pub async fn drain_queue(&self) -> Result<Vec<OrchestrationReport>, TollgateError> {
        self.orchestrator.drain_queue(&self.triggers).await
    }

    /// Requests cancellation of a run.
    pub fn cancel(&self, run_id: Uuid, reason: impl Into<String>) -> bool {
        self.scheduler.cancel(run_id, reason)
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The project.
    #[must_use]
    pub fn project(&self) -> &Arc<Project> {
        &self.project
    }

    /// The scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<PipelineScheduler> {
        &self.scheduler
    }

    /// The trigger engine.
    #[must_use]
    pub fn triggers(&self) -> &Arc<TriggerEngine> {
        &self.triggers
    }

    /// The run store.
    #[must_use]
    pub fn runs(&self) -> &Arc<RunStore> {
        self.scheduler.runs()
    }

    /// The artifact store.
    #[must_use]
    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        self.scheduler.artifacts()
    }

    /// Captured step logs.
    #[must_use]
    pub fn logs(&self) -> &Arc<LogStore> {
        self.scheduler.executor().logs()
    }
}
