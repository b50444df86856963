//! Dependency-aware execution of a target build and its closure.
//!
//! Builds whose dependencies are satisfied are started as soon as possible,
//! bounded by `max_parallel_runs`. A dependent never starts before its
//! dependencies finished and their artifacts were copied in.

use crate::artifacts::{ArtifactError, ArtifactRules};
use crate::core::{BuildDefinition, BuildId, BuildRun, Dependency, Project, RunFailure, RunRequest, RunStatus};
use crate::errors::TollgateError;
use crate::events::names;
use crate::observability::SpanTimer;
use crate::pipeline::{resolve, PipelineScheduler};
use crate::triggers::{TriggerEngine, TriggerEvent};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of one orchestrated target.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationReport {
    /// The requested build.
    pub target: BuildId,
    /// Logical branch.
    pub branch: String,
    /// Success only if every run in the closure succeeded.
    pub status: RunStatus,
    /// Final run snapshots in dependency order, target last.
    pub runs: Vec<BuildRun>,
    /// Runs reused instead of executed.
    pub reused: Vec<Uuid>,
    /// Wall-clock duration of the orchestration.
    pub duration_ms: f64,
}

impl OrchestrationReport {
    /// The run used for a build.
    #[must_use]
    pub fn run_for(&self, build_id: &str) -> Option<&BuildRun> {
        self.runs.iter().find(|run| run.build_id == build_id)
    }

    /// The target's run.
    #[must_use]
    pub fn target_run(&self) -> Option<&BuildRun> {
        self.run_for(&self.target)
    }

    /// Returns true if every run succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

fn aggregate(runs: &[BuildRun], target: &str) -> RunStatus {
    if runs.iter().all(|run| run.status == RunStatus::Success) {
        RunStatus::Success
    } else if runs
        .iter()
        .any(|run| run.build_id == target && run.status == RunStatus::Cancelled)
    {
        RunStatus::Cancelled
    } else {
        RunStatus::Failed
    }
}

type RunTask = tokio::task::JoinHandle<Result<(BuildId, BuildRun), TollgateError>>;

/// Runs targets with their dependency closure.
pub struct BuildOrchestrator {
    project: Arc<Project>,
    scheduler: Arc<PipelineScheduler>,
    triggers: Option<Arc<TriggerEngine>>,
    slots: Arc<Semaphore>,
    max_parallel: usize,
    reuse_successful_runs: bool,
}

impl std::fmt::Debug for BuildOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildOrchestrator")
            .field("project", &self.project.id())
            .field("max_parallel", &self.max_parallel)
            .field("reuse_successful_runs", &self.reuse_successful_runs)
            .finish_non_exhaustive()
    }
}

impl BuildOrchestrator {
    /// Creates an orchestrator running up to four builds at once.
    #[must_use]
    pub fn new(project: Arc<Project>, scheduler: Arc<PipelineScheduler>) -> Self {
        Self {
            project,
            scheduler,
            triggers: None,
            slots: Arc::new(Semaphore::new(4)),
            max_parallel: 4,
            reuse_successful_runs: true,
        }
    }

    /// Bounds concurrently executing runs.
    #[must_use]
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        let max_parallel = max_parallel.max(1);
        self.slots = Arc::new(Semaphore::new(max_parallel));
        self.max_parallel = max_parallel;
        self
    }

    /// Reuses the latest successful run of a dependency on the same branch.
    #[must_use]
    pub fn with_reuse(mut self, reuse: bool) -> Self {
        self.reuse_successful_runs = reuse;
        self
    }

    /// Submits a `BuildFinished` event to `triggers` after each run.
    #[must_use]
    pub fn with_triggers(mut self, triggers: Arc<TriggerEngine>) -> Self {
        self.triggers = Some(triggers);
        self
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

    /// Runs the requested build after its dependencies.
    ///
    /// # Errors
    ///
    /// Fails with [`TollgateError::CycleDetected`] or
    /// [`TollgateError::UnknownBuild`] before any run is created, and with
    /// the first internal error a run task reports.
    pub async fn run(&self, request: RunRequest) -> Result<OrchestrationReport, TollgateError> {
        let timer = SpanTimer::start(format!("orchestrate {}", request.build_id));
        let closure = resolve(&self.project, &request.build_id)?;
        let target = request.build_id.clone();

        let mut finished: HashMap<BuildId, BuildRun> = HashMap::new();
        if self.reuse_successful_runs {
            for build_id in closure.iter().filter(|id| **id != target) {
                let latest = self
                    .scheduler
                    .runs()
                    .latest(build_id, &request.branch, Some(RunStatus::Success));
                if let Some(run) = latest {
                    debug!(build_id = %build_id, run_id = %run.id, "Reusing successful run");
                    finished.insert(build_id.clone(), run);
                }
            }
        }

        // Dependencies of a reused run are not needed unless something else needs them.
        let mut needed: HashSet<&str> = HashSet::from([target.as_str()]);
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for build_id in closure.iter().rev() {
            if !needed.contains(build_id.as_str()) {
                continue;
            }
            let def = self.definition(build_id)?;
            in_degree.insert(build_id.as_str(), def.dependency_ids().len());
            if !finished.contains_key(build_id) {
                for dep in def.dependency_ids() {
                    if let Some(id) = closure.iter().find(|id| *id == dep) {
                        needed.insert(id.as_str());
                    }
                }
            }
        }
        let order: Vec<BuildId> = closure
            .iter()
            .filter(|id| needed.contains(id.as_str()))
            .cloned()
            .collect();
        finished.retain(|id, _| needed.contains(id.as_str()));
        let reused: Vec<Uuid> = order
            .iter()
            .filter_map(|id| finished.get(id).map(|run| run.id))
            .collect();
        info!(target = %target, branch = %request.branch, builds = order.len(), reused = reused.len(), "Orchestrating build");

        let mut active: FuturesUnordered<RunTask> = FuturesUnordered::new();
        let mut started: HashSet<BuildId> = finished.keys().cloned().collect();
        let mut ready: Vec<BuildId> = Vec::new();
        for build_id in finished.keys() {
            self.mark_done(build_id, &order, &mut in_degree, &mut ready);
        }
        for build_id in &order {
            if in_degree.get(build_id.as_str()) == Some(&0) && !ready.contains(build_id) {
                ready.push(build_id.clone());
            }
        }

        loop {
            ready.sort_by_key(|id| order.iter().position(|o| o == id));
            for build_id in ready.drain(..) {
                if !started.insert(build_id.clone()) {
                    continue;
                }
                let task = self.spawn_run(&build_id, &request, &finished).await?;
                active.push(task);
            }

            let Some(joined) = active.next().await else {
                break;
            };
            let (build_id, run) = joined.map_err(|e| TollgateError::Internal(format!("Run task join error: {e}")))??;

            if let Some(triggers) = &self.triggers {
                triggers.submit(TriggerEvent::BuildFinished {
                    build: run.build_id.clone(),
                    run_id: run.id,
                    branch: run.branch.clone(),
                    is_default_branch: run.is_default_branch,
                    status: run.status,
                });
            }
            finished.insert(build_id.clone(), run);
            self.mark_done(&build_id, &order, &mut in_degree, &mut ready);
        }

        let runs: Vec<BuildRun> = order.iter().filter_map(|id| finished.remove(id)).collect();
        if runs.len() != order.len() {
            return Err(TollgateError::Internal(format!(
                "Orchestration of '{target}' finished {} of {} builds",
                runs.len(),
                order.len()
            )));
        }
        let status = aggregate(&runs, &target);
        info!(target = %target, status = %status, runs = runs.len(), reused = reused.len(), "Orchestration finished");

        Ok(OrchestrationReport {
            target,
            branch: request.branch,
            status,
            runs,
            reused,
            duration_ms: timer.finish(),
        })
    }

    /// Executes every queued request of `triggers`, including requests
    /// fired by the runs it executes, until the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns the first orchestration error.
    pub async fn drain_queue(&self, triggers: &TriggerEngine) -> Result<Vec<OrchestrationReport>, TollgateError> {
        let mut reports = Vec::new();
        loop {
            triggers.process_pending().await;
            let Some(request) = triggers.pop() else {
                break;
            };
            reports.push(self.run(request).await?);
        }
        Ok(reports)
    }

    fn definition(&self, build_id: &str) -> Result<Arc<BuildDefinition>, TollgateError> {
        self.project
            .build(build_id)
            .cloned()
            .ok_or_else(|| TollgateError::UnknownBuild(build_id.to_string()))
    }

    fn mark_done(
        &self,
        build_id: &str,
        order: &[BuildId],
        in_degree: &mut HashMap<&str, usize>,
        ready: &mut Vec<BuildId>,
    ) {
        for candidate in order {
            let Some(def) = self.project.build(candidate) else {
                continue;
            };
            if def.dependency_ids().contains(&build_id) {
                if let Some(count) = in_degree.get_mut(candidate.as_str()) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        ready.push(candidate.clone());
                    }
                }
            }
        }
    }

    async fn spawn_run(
        &self,
        build_id: &str,
        request: &RunRequest,
        finished: &HashMap<BuildId, BuildRun>,
    ) -> Result<RunTask, TollgateError> {
        let def = self.definition(build_id)?;
        let run_request = if build_id == request.build_id {
            request.clone()
        } else {
            request.for_dependency(build_id, &request.build_id)
        };
        let run = self.scheduler.create_run(&self.project, &run_request).await?;

        let deps: Vec<(Dependency, BuildRun)> = def
            .dependencies
            .iter()
            .filter_map(|dep| finished.get(&dep.target).map(|run| (dep.clone(), run.clone())))
            .collect();
        let project = Arc::clone(&self.project);
        let scheduler = Arc::clone(&self.scheduler);
        let slots = Arc::clone(&self.slots);
        let build_id = build_id.to_string();

        Ok(tokio::spawn(async move {
            let _permit = slots
                .acquire_owned()
                .await
                .map_err(|_| TollgateError::Internal("run slots closed".to_string()))?;
            let run = prepare_and_execute(&project, &scheduler, &def, run, &deps).await?;
            Ok((build_id, run))
        }))
    }
}

async fn prepare_and_execute(
    project: &Project,
    scheduler: &PipelineScheduler,
    def: &BuildDefinition,
    mut run: BuildRun,
    deps: &[(Dependency, BuildRun)],
) -> Result<BuildRun, TollgateError> {
    if let Some((_, failed)) = deps.iter().find(|(_, upstream)| upstream.status != RunStatus::Success) {
        let failure = RunFailure::new(
            "dependency_failed",
            format!("Dependency '{}' finished {}", failed.build_id, failed.status),
        );
        return scheduler.fail_pending(run, failure).await;
    }

    for (dep, upstream) in deps.iter().filter(|(dep, _)| dep.kind == crate::core::DependencyKind::Artifact) {
        if let Err(e) = copy_dependency(scheduler, def, &mut run, dep, upstream).await {
            warn!(run_id = %run.id, upstream = %upstream.build_id, error = %e, "Artifact dependency failed");
            let failure = RunFailure::new("artifact_dependency", e.to_string());
            return scheduler.fail_pending(run, failure).await;
        }
    }

    scheduler.execute(project, run).await
}

async fn copy_dependency(
    scheduler: &PipelineScheduler,
    def: &BuildDefinition,
    run: &mut BuildRun,
    dep: &Dependency,
    upstream: &BuildRun,
) -> Result<(), TollgateError> {
    let store = scheduler.artifacts();
    let rules = ArtifactRules::parse(&dep.artifact_rules).map_err(ArtifactError::from)?;
    let copied = store
        .copy_into(upstream.id, run.id, &run.build_id, &rules, dep.clean_destination)
        .await?;
    scheduler.missing_artifact_policy().check(&copied, run.id)?;

    if !def.is_composite() {
        for artifact in &copied.artifacts {
            let bytes = store.read(&artifact.id).await?;
            let target = run.checkout_dir.join(&artifact.path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, bytes).await?;
        }
    }

    info!(
        run_id = %run.id,
        upstream = %upstream.build_id,
        upstream_run = %upstream.id,
        copied = copied.artifacts.len(),
        "Copied dependency artifacts"
    );
    scheduler
        .events()
        .emit(
            names::ARTIFACTS_COPIED,
            Some(json!({
                "run_id": run.id.to_string(),
                "source_run_id": upstream.id.to_string(),
                "count": copied.artifacts.len(),
            })),
        )
        .await;
    run.add_artifacts(copied.artifacts)?;
    scheduler.runs().record(run);
    Ok(())
}
