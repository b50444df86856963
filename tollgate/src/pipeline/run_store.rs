//! Shared snapshots of build runs.

use crate::core::{BuildRun, RunStatus};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Latest known state of every run, plus per-build numbering.
///
/// Schedulers write a snapshot on each transition; everything else reads.
#[derive(Debug, Default)]
pub struct RunStore {
    runs: DashMap<Uuid, BuildRun>,
    numbers: DashMap<String, AtomicU64>,
}

impl RunStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a snapshot of `run`, replacing any previous one.
    pub fn record(&self, run: &BuildRun) {
        self.runs.insert(run.id, run.clone());
    }

    /// Snapshot of a run.
    #[must_use]
    pub fn get(&self, run_id: Uuid) -> Option<BuildRun> {
        self.runs.get(&run_id).map(|run| run.clone())
    }

    /// Allocates the next build number of a build, starting at 1.
    pub fn next_build_number(&self, build_id: &str) -> u64 {
        if let Some(counter) = self.numbers.get(build_id) {
            return counter.fetch_add(1, Ordering::SeqCst) + 1;
        }
        self.numbers
            .entry(build_id.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::SeqCst)
            + 1
    }

    /// Runs of a build, oldest first.
    #[must_use]
    pub fn runs_for(&self, build_id: &str) -> Vec<BuildRun> {
        let mut runs: Vec<BuildRun> = self
            .runs
            .iter()
            .filter(|entry| entry.build_id == build_id)
            .map(|entry| entry.value().clone())
            .collect();
        runs.sort_by_key(|run| run.build_number);
        runs
    }

    /// The newest run of a build on a branch, optionally with a given status.
    #[must_use]
    pub fn latest(&self, build_id: &str, branch: &str, status: Option<RunStatus>) -> Option<BuildRun> {
        self.runs
            .iter()
            .filter(|entry| entry.build_id == build_id && entry.branch == branch)
            .filter(|entry| status.map_or(true, |s| entry.status == s))
            .max_by_key(|entry| entry.build_number)
            .map(|entry| entry.value().clone())
    }

    /// Drops the snapshot of a run.
    pub fn evict(&self, run_id: Uuid) -> Option<BuildRun> {
        self.runs.remove(&run_id).map(|(_, run)| run)
    }

    /// Keeps the newest `keep` finished runs of a build and drops the
    /// older ones. Unfinished runs are never dropped.
    ///
    /// Returns the ids of the dropped runs.
    pub fn retain_latest(&self, build_id: &str, keep: usize) -> Vec<Uuid> {
        let mut finished: Vec<(Uuid, u64)> = self
            .runs
            .iter()
            .filter(|entry| entry.build_id == build_id && entry.status.is_terminal())
            .map(|entry| (*entry.key(), entry.build_number))
            .collect();
        finished.sort_by(|a, b| b.1.cmp(&a.1));

        finished
            .into_iter()
            .skip(keep)
            .filter_map(|(run_id, _)| self.evict(run_id).map(|run| run.id))
            .collect()
    }

    /// Number of stored runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Returns true if no run is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}
