//! Drives a single build run through its lifecycle.

use super::RunStore;
use crate::artifacts::{ArtifactError, ArtifactRules, ArtifactStore, MissingArtifactPolicy};
use crate::cancellation::CancellationToken;
use crate::core::{BuildDefinition, BuildRun, Project, RunFailure, RunRequest, RunStatus, StepResult, StepStatus};
use crate::errors::TollgateError;
use crate::events::{names, run_payload, step_payload, EventSink};
use crate::params::{predefined, ParameterResolver};
use crate::step::{StepContext, StepExecutor};
use dashmap::DashMap;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

/// Executes build runs: steps in order, then artifact publication.
///
/// Every transition is written to the [`RunStore`] and emitted on the
/// [`EventSink`] before the next one happens.
pub struct PipelineScheduler {
    executor: StepExecutor,
    artifacts: Arc<dyn ArtifactStore>,
    runs: Arc<RunStore>,
    events: Arc<dyn EventSink>,
    params: ParameterResolver,
    missing_artifacts: MissingArtifactPolicy,
    retention: Option<usize>,
    work_root: PathBuf,
    tokens: DashMap<Uuid, Arc<CancellationToken>>,
}

impl std::fmt::Debug for PipelineScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineScheduler")
            .field("work_root", &self.work_root)
            .field("missing_artifacts", &self.missing_artifacts)
            .field("active_runs", &self.tokens.len())
            .finish_non_exhaustive()
    }
}

impl PipelineScheduler {
    /// Creates a scheduler. Checkout directories are created below `work_root`.
    #[must_use]
    pub fn new(
        executor: StepExecutor,
        artifacts: Arc<dyn ArtifactStore>,
        runs: Arc<RunStore>,
        events: Arc<dyn EventSink>,
        work_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executor,
            artifacts,
            runs,
            events,
            params: ParameterResolver::new(),
            missing_artifacts: MissingArtifactPolicy::default(),
            retention: None,
            work_root: work_root.into(),
            tokens: DashMap::new(),
        }
    }

    /// Sets the base resolver (environment and secret scopes) for every run.
    #[must_use]
    pub fn with_parameters(mut self, params: ParameterResolver) -> Self {
        self.params = params;
        self
    }

    /// Sets how rules that match nothing are reported.
    #[must_use]
    pub fn with_missing_artifact_policy(mut self, policy: MissingArtifactPolicy) -> Self {
        self.missing_artifacts = policy;
        self
    }

    /// Keeps artifacts, snapshots and logs of only the newest `keep` runs
    /// of each build. Zero is treated as one.
    #[must_use]
    pub fn with_retention(mut self, keep: Option<usize>) -> Self {
        self.retention = keep;
        self
    }

    /// The run store.
    #[must_use]
    pub fn runs(&self) -> &Arc<RunStore> {
        &self.runs
    }

    /// The artifact store.
    #[must_use]
    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    /// The event sink.
    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// The step executor.
    #[must_use]
    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    /// The policy for rules that match nothing.
    #[must_use]
    pub fn missing_artifact_policy(&self) -> MissingArtifactPolicy {
        self.missing_artifacts
    }

    async fn persist(&self, run: &BuildRun, event: &str) {
        self.runs.record(run);
        self.events.emit(event, Some(run_payload(run))).await;
    }

    /// Creates a `Pending` run for a request.
    ///
    /// # Errors
    ///
    /// [`TollgateError::UnknownBuild`] if the project has no such build.
    pub async fn create_run(&self, project: &Project, request: &RunRequest) -> Result<BuildRun, TollgateError> {
        if project.build(&request.build_id).is_none() {
            return Err(TollgateError::UnknownBuild(request.build_id.clone()));
        }
        let number = self.runs.next_build_number(&request.build_id);
        let checkout_dir = self.work_root.join(&request.build_id).join(number.to_string());
        let run = BuildRun::new(request, number, checkout_dir);

        self.tokens.insert(run.id, Arc::new(CancellationToken::new()));
        info!(run_id = %run.id, build_id = %run.build_id, build_number = number, branch = %run.branch, "Run created");
        self.persist(&run, names::RUN_CREATED).await;
        Ok(run)
    }

    /// Requests cancellation of a pending or running run.
    ///
    /// Returns false when the run is unknown or already finished.
    pub fn cancel(&self, run_id: Uuid, reason: impl Into<String>) -> bool {
        let token = self.tokens.get(&run_id).map(|t| Arc::clone(t.value()));
        match token {
            Some(token) => {
                let reason = reason.into();
                info!(run_id = %run_id, reason = %reason, "Cancellation requested");
                token.cancel(reason);
                true
            }
            None => false,
        }
    }

    /// Fails a pending run without running any step.
    ///
    /// # Errors
    ///
    /// [`TollgateError::Transition`] if the run is not pending.
    pub async fn fail_pending(&self, mut run: BuildRun, failure: RunFailure) -> Result<BuildRun, TollgateError> {
        warn!(run_id = %run.id, build_id = %run.build_id, code = %failure.code, "Run failed before start");
        run.fail_to_start(failure)?;
        self.tokens.remove(&run.id);
        self.persist(&run, names::RUN_FINISHED).await;
        Ok(run)
    }

    fn resolver_for(&self, project: &Project, def: &BuildDefinition, run: &BuildRun) -> ParameterResolver {
        let predefined = BTreeMap::from([
            (predefined::BRANCH.to_string(), run.branch.clone()),
            (predefined::BRANCH_IS_DEFAULT.to_string(), run.is_default_branch.to_string()),
            (predefined::BUILD_NUMBER.to_string(), run.build_number.to_string()),
            (predefined::CHECKOUT_DIR.to_string(), run.checkout_dir.display().to_string()),
            (predefined::BUILD_ID.to_string(), run.build_id.clone()),
            (predefined::RUN_ID.to_string(), run.id.to_string()),
        ]);
        self.params
            .clone()
            .with_predefined(predefined)
            .with_run(run.parameters.clone())
            .with_build(def.parameters.clone())
            .with_global(project.parameters().clone())
    }

    /// Executes a pending run to a terminal status and returns the final
    /// snapshot.
    ///
    /// # Errors
    ///
    /// [`TollgateError::UnknownBuild`] for a run of an unregistered build,
    /// [`TollgateError::Transition`] if the run is not pending. A checkout
    /// directory that cannot be created fails the run instead.
    pub async fn execute(&self, project: &Project, run: BuildRun) -> Result<BuildRun, TollgateError> {
        let span = tracing::info_span!("run", run_id = %run.id, build_id = %run.build_id);
        self.execute_inner(project, run).instrument(span).await
    }

    async fn execute_inner(&self, project: &Project, mut run: BuildRun) -> Result<BuildRun, TollgateError> {
        let def = Arc::clone(
            project
                .build(&run.build_id)
                .ok_or_else(|| TollgateError::UnknownBuild(run.build_id.clone()))?,
        );
        let token = Arc::clone(
            self.tokens
                .entry(run.id)
                .or_insert_with(|| Arc::new(CancellationToken::new()))
                .value(),
        );

        let result = self.drive(project, &def, &mut run, &token).await;
        self.tokens.remove(&run.id);
        result?;
        Ok(run)
    }

    async fn drive(
        &self,
        project: &Project,
        def: &BuildDefinition,
        run: &mut BuildRun,
        token: &CancellationToken,
    ) -> Result<(), TollgateError> {
        if token.is_cancelled() {
            let reason = token.reason().unwrap_or_default();
            run.cancel_pending(reason)?;
            info!(run_id = %run.id, "Run cancelled before start");
            self.persist(run, names::RUN_FINISHED).await;
            return Ok(());
        }

        if let Err(e) = tokio::fs::create_dir_all(&run.checkout_dir).await {
            warn!(run_id = %run.id, checkout_dir = %run.checkout_dir.display(), error = %e, "Checkout directory unavailable");
            run.fail_to_start(RunFailure::new(
                "checkout_unavailable",
                format!("Cannot create checkout directory {}: {e}", run.checkout_dir.display()),
            ))?;
            self.persist(run, names::RUN_FINISHED).await;
            return Ok(());
        }
        run.start()?;
        info!(run_id = %run.id, build_number = run.build_number, branch = %run.branch, "Run started");
        self.persist(run, names::RUN_STARTED).await;

        let params = self.resolver_for(project, def, run);
        let checkout_dir = run.checkout_dir.clone();
        let mut status = RunStatus::Success;

        for step in &def.steps {
            if token.is_cancelled() {
                status = RunStatus::Cancelled;
                break;
            }

            if let Some(condition) = &step.condition {
                if !condition.is_satisfied_by(|name| params.lookup(name)) {
                    info!(run_id = %run.id, step_id = %step.id, "Step skipped, condition not met");
                    let result = StepResult::skipped(&step.id, "condition not met");
                    self.record_step(run, result).await?;
                    continue;
                }
            }

            let ctx = StepContext {
                run_id: run.id,
                params: &params,
                cancel: token,
                checkout_dir: &checkout_dir,
            };
            let execution = self.executor.execute(step, &ctx).await;
            let step_status = execution.result.status;
            let log_ref = execution.result.log_ref.clone();
            self.record_step(run, execution.result).await?;

            match step_status {
                StepStatus::Success | StepStatus::Skipped => {}
                StepStatus::Cancelled => {
                    status = RunStatus::Cancelled;
                    break;
                }
                StepStatus::Failed | StepStatus::TimedOut if step.best_effort => {
                    warn!(run_id = %run.id, step_id = %step.id, status = %step_status, "Best-effort step failed, continuing");
                }
                StepStatus::Failed | StepStatus::TimedOut => {
                    let (code, message) = execution.error.as_ref().map_or_else(
                        || ("step_failed", format!("Step '{}' failed", step.id)),
                        |e| (e.code(), e.to_string()),
                    );
                    run.record_failure(RunFailure::new(code, message).at_step(&step.id, log_ref))?;
                    status = RunStatus::Failed;
                    break;
                }
            }
        }

        if status == RunStatus::Cancelled {
            let reason = token.reason().unwrap_or_else(|| "cancelled".to_string());
            let step_id = run
                .steps
                .last()
                .filter(|s| s.status == StepStatus::Cancelled)
                .map(|s| (s.step_id.clone(), s.log_ref.clone()));
            let failure = RunFailure::new("cancelled", reason);
            let failure = match step_id {
                Some((id, log_ref)) => failure.at_step(id, log_ref),
                None => failure,
            };
            run.record_failure(failure)?;
        }

        if def.publish_mode.publishes(status) {
            status = self.publish(def, run, status).await?;
        }

        run.finish(status)?;
        info!(
            run_id = %run.id,
            status = %run.status,
            steps = run.steps.len(),
            artifacts = run.artifacts.len(),
            "Run finished"
        );
        self.persist(run, names::RUN_FINISHED).await;

        if let Some(keep) = self.retention {
            self.apply_retention(&run.build_id, keep.max(1)).await;
        }
        Ok(())
    }

    /// Drops artifacts, snapshots and logs of all but the newest `keep`
    /// runs of a build. A run whose artifacts are pruned is evicted too, so
    /// it can no longer be reused.
    async fn apply_retention(&self, build_id: &str, keep: usize) {
        let mut evicted = match self.artifacts.retain_latest(build_id, keep).await {
            Ok(pruned) => {
                if !pruned.is_empty() {
                    info!(build_id = %build_id, pruned = pruned.len(), keep, "Pruned old run artifacts");
                }
                pruned
            }
            Err(e) => {
                warn!(build_id = %build_id, error = %e, "Artifact retention failed");
                Vec::new()
            }
        };
        for run_id in &evicted {
            self.runs.evict(*run_id);
        }
        evicted.extend(self.runs.retain_latest(build_id, keep));

        let logs: usize = evicted.iter().map(|run_id| self.executor.logs().evict_run(*run_id)).sum();
        if !evicted.is_empty() {
            info!(build_id = %build_id, runs = evicted.len(), logs, "Evicted old runs");
        }
    }

    async fn record_step(&self, run: &mut BuildRun, result: StepResult) -> Result<(), TollgateError> {
        let payload = step_payload(run, &result);
        run.record_step(result)?;
        self.runs.record(run);
        self.events.emit(names::STEP_FINISHED, Some(payload)).await;
        Ok(())
    }

    /// Publishes the run's artifact rules output. Returns the status the
    /// run finishes with.
    async fn publish(
        &self,
        def: &BuildDefinition,
        run: &mut BuildRun,
        status: RunStatus,
    ) -> Result<RunStatus, TollgateError> {
        let rules = match ArtifactRules::parse(&def.artifact_rules) {
            Ok(rules) => rules,
            Err(e) => return Self::publication_failed(run, status, &ArtifactError::from(e)),
        };
        let outcome = match self
            .artifacts
            .put(run.id, &run.build_id, &run.checkout_dir, &rules)
            .await
        {
            Ok(publication) => {
                let checked = self.missing_artifacts.check(&publication, run.id);
                let count = publication.artifacts.len();
                run.add_artifacts(publication.artifacts)?;
                self.events
                    .emit(
                        names::ARTIFACTS_PUBLISHED,
                        Some(json!({
                            "run_id": run.id.to_string(),
                            "build_id": run.build_id,
                            "count": count,
                            "unmatched": publication.unmatched_rules,
                        })),
                    )
                    .await;
                checked
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => Ok(status),
            Err(e) => Self::publication_failed(run, status, &e),
        }
    }

    /// A failed publication fails an otherwise successful run.
    fn publication_failed(run: &mut BuildRun, status: RunStatus, error: &ArtifactError) -> Result<RunStatus, TollgateError> {
        warn!(run_id = %run.id, error = %error, "Artifact publication failed");
        if status == RunStatus::Success {
            run.record_failure(RunFailure::new("artifact_publication", error.to_string()))?;
            Ok(RunStatus::Failed)
        } else {
            Ok(status)
        }
    }
}
