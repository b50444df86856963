//! Trigger evaluation: external events in, run requests out.
//!
//! Events are submitted to an inbox and only evaluated when
//! [`TriggerEngine::process_pending`] is called. Matching requests are
//! appended to an inspectable build queue.

mod branch_spec;

pub use branch_spec::{short_name, BranchSpec, BranchSpecError, DEFAULT_BRANCH_TOKEN};

use crate::core::{BuildId, Project, RunRequest, RunStatus, TriggerCause, TriggerDefinition};
use crate::errors::{codes, ConfigurationError};
use crate::events::{names, EventSink, NoOpEventSink};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// An external event the engine reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerEvent {
    /// A commit landed on a ref of a VCS root.
    VcsChange {
        /// The VCS root id.
        vcs_root: String,
        /// Full ref, e.g. `refs/heads/main`.
        git_ref: String,
        /// Commit revision.
        revision: String,
    },
    /// A run reached a terminal status.
    BuildFinished {
        /// The build that ran.
        build: BuildId,
        /// The finished run.
        run_id: Uuid,
        /// Logical branch of the run.
        branch: String,
        /// Whether the branch is the default branch.
        is_default_branch: bool,
        /// Final status.
        status: RunStatus,
    },
}

#[derive(Debug)]
struct RootWatch {
    spec: BranchSpec,
    default_ref: String,
}

impl RootWatch {
    /// Logical name and default flag of a ref, or `None` if the root ignores it.
    fn classify(&self, git_ref: &str) -> Option<(String, bool)> {
        let is_default = git_ref == self.default_ref;
        let name = self
            .spec
            .logical_name(git_ref)
            .or_else(|| is_default.then(|| short_name(git_ref).to_string()))?;
        Some((name, is_default))
    }
}

#[derive(Debug)]
struct Watch {
    build_id: BuildId,
    trigger: TriggerDefinition,
    vcs_root: Option<String>,
    filter: BranchSpec,
}

/// Watches a project's trigger definitions.
pub struct TriggerEngine {
    watches: Vec<Watch>,
    roots: BTreeMap<String, RootWatch>,
    inbox: Mutex<VecDeque<TriggerEvent>>,
    queue: Mutex<VecDeque<RunRequest>>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for TriggerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerEngine")
            .field("watches", &self.watches.len())
            .field("inbox", &self.inbox.lock().len())
            .field("queue", &self.queue.lock().len())
            .finish_non_exhaustive()
    }
}

fn invalid_spec(build: &str, e: &BranchSpecError) -> ConfigurationError {
    ConfigurationError::coded(codes::INVALID_BRANCH_SPEC, format!("invalid branch spec: {e}")).for_build(build)
}

impl TriggerEngine {
    /// Builds the watch list from every trigger in the project.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] for a malformed branch spec.
    pub fn new(project: &Project) -> Result<Self, ConfigurationError> {
        let mut roots = BTreeMap::new();
        let mut watches = Vec::new();

        for def in project.builds() {
            for trigger in &def.triggers {
                let filter = match trigger {
                    TriggerDefinition::Vcs { branch_filter } | TriggerDefinition::FinishedBuild { branch_filter, .. } => {
                        BranchSpec::parse(branch_filter.as_deref().unwrap_or_default())
                            .map_err(|e| invalid_spec(&def.id, &e))?
                    }
                };
                if let (TriggerDefinition::Vcs { .. }, Some(root_id)) = (trigger, &def.vcs_root) {
                    if !roots.contains_key(root_id) {
                        if let Some(root) = project.vcs_root(root_id) {
                            let spec = BranchSpec::parse(&root.branch_spec).map_err(|e| invalid_spec(&def.id, &e))?;
                            roots.insert(
                                root_id.clone(),
                                RootWatch {
                                    spec,
                                    default_ref: root.default_branch.clone(),
                                },
                            );
                        }
                    }
                }
                watches.push(Watch {
                    build_id: def.id.clone(),
                    trigger: trigger.clone(),
                    vcs_root: def.vcs_root.clone(),
                    filter,
                });
            }
        }

        debug!(watches = watches.len(), roots = roots.len(), "Trigger watch list built");
        Ok(Self {
            watches,
            roots,
            inbox: Mutex::new(VecDeque::new()),
            queue: Mutex::new(VecDeque::new()),
            events: Arc::new(NoOpEventSink),
        })
    }

    /// Sets the sink `trigger.fired` events go to.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// The (build, trigger) pairs being watched.
    #[must_use]
    pub fn watch_list(&self) -> Vec<(BuildId, TriggerDefinition)> {
        self.watches
            .iter()
            .map(|w| (w.build_id.clone(), w.trigger.clone()))
            .collect()
    }

    /// Puts an event into the inbox without evaluating it.
    pub fn submit(&self, event: TriggerEvent) {
        self.inbox.lock().push_back(event);
    }

    /// Events not yet processed.
    #[must_use]
    pub fn inbox_len(&self) -> usize {
        self.inbox.lock().len()
    }

    fn requests_for(&self, event: &TriggerEvent) -> Vec<RunRequest> {
        let mut requests = Vec::new();
        for watch in &self.watches {
            let request = match (&watch.trigger, event) {
                (
                    TriggerDefinition::Vcs { .. },
                    TriggerEvent::VcsChange {
                        vcs_root,
                        git_ref,
                        revision,
                    },
                ) => {
                    if watch.vcs_root.as_deref() != Some(vcs_root.as_str()) {
                        continue;
                    }
                    let Some((branch, is_default)) = self.roots.get(vcs_root).and_then(|root| root.classify(git_ref))
                    else {
                        continue;
                    };
                    RunRequest {
                        build_id: watch.build_id.clone(),
                        branch,
                        is_default_branch: is_default,
                        cause: TriggerCause::Vcs {
                            revision: revision.clone(),
                        },
                        parameters: BTreeMap::new(),
                    }
                }
                (
                    TriggerDefinition::FinishedBuild {
                        upstream,
                        successful_only,
                        ..
                    },
                    TriggerEvent::BuildFinished {
                        build,
                        run_id,
                        branch,
                        is_default_branch,
                        status,
                    },
                ) => {
                    if upstream != build {
                        continue;
                    }
                    let fires = if *successful_only {
                        *status == RunStatus::Success
                    } else {
                        status.is_terminal()
                    };
                    if !fires {
                        continue;
                    }
                    RunRequest {
                        build_id: watch.build_id.clone(),
                        branch: branch.clone(),
                        is_default_branch: *is_default_branch,
                        cause: TriggerCause::FinishedBuild {
                            upstream: upstream.clone(),
                            run_id: *run_id,
                        },
                        parameters: BTreeMap::new(),
                    }
                }
                _ => continue,
            };

            if watch.filter.accepts(&request.branch, request.is_default_branch) {
                requests.push(request);
            } else {
                debug!(build_id = %watch.build_id, branch = %request.branch, "Branch filtered out by trigger");
            }
        }
        requests
    }

    /// Evaluates every event in the inbox and returns how many requests
    /// were added to the queue.
    pub async fn process_pending(&self) -> usize {
        let events: Vec<TriggerEvent> = self.inbox.lock().drain(..).collect();
        let mut enqueued = Vec::new();

        for event in &events {
            for request in self.requests_for(event) {
                let merged = {
                    let mut queue = self.queue.lock();
                    let duplicate = queue
                        .iter()
                        .any(|pending| pending.build_id == request.build_id && pending.branch == request.branch);
                    if !duplicate {
                        queue.push_back(request.clone());
                    }
                    duplicate
                };
                if merged {
                    debug!(build_id = %request.build_id, branch = %request.branch, "Merged with pending request");
                } else {
                    enqueued.push(request);
                }
            }
        }

        for request in &enqueued {
            info!(build_id = %request.build_id, branch = %request.branch, "Trigger fired");
            self.events
                .emit(
                    names::TRIGGER_FIRED,
                    Some(json!({
                        "build_id": request.build_id,
                        "branch": request.branch,
                        "cause": request.cause,
                    })),
                )
                .await;
        }
        enqueued.len()
    }

    /// Snapshot of the build queue.
    #[must_use]
    pub fn pending_requests(&self) -> Vec<RunRequest> {
        self.queue.lock().iter().cloned().collect()
    }

    /// Takes the oldest queued request.
    pub fn pop(&self) -> Option<RunRequest> {
        self.queue.lock().pop_front()
    }

    /// Takes every queued request, oldest first.
    pub fn drain(&self) -> Vec<RunRequest> {
        self.queue.lock().drain(..).collect()
    }
}
