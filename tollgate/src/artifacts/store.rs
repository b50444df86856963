//! Catalog-backed [`ArtifactStore`] over a pluggable blob backend.

use super::{scan_workspace, ArtifactError, ArtifactRules, ArtifactStore, Publication};
use crate::core::Artifact;
use crate::utils::sha256_hex;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};
use uuid::Uuid;

/// Content storage behind a [`CatalogStore`].
#[async_trait]
pub trait BlobBackend: Send + Sync {
    /// Stores content for a run path and returns its locator.
    async fn write(&self, run_id: Uuid, path: &str, bytes: Vec<u8>) -> Result<String, ArtifactError>;

    /// Reads content by locator.
    async fn read(&self, locator: &str) -> Result<Vec<u8>, ArtifactError>;

    /// Deletes content by locator. Missing content is not an error.
    async fn delete(&self, locator: &str) -> Result<(), ArtifactError>;

    /// Drops whatever the backend keeps for a whole run.
    async fn purge_run(&self, _run_id: Uuid) -> Result<(), ArtifactError> {
        Ok(())
    }
}

#[derive(Debug)]
struct RunEntry {
    build_id: String,
    seq: u64,
    artifacts: BTreeMap<String, Artifact>,
}

/// Artifact store keeping its catalog in memory and content in `B`.
pub struct CatalogStore<B> {
    blobs: B,
    runs: DashMap<Uuid, RunEntry>,
    seq: AtomicU64,
}

impl<B: BlobBackend> CatalogStore<B> {
    /// Creates a store over a backend.
    #[must_use]
    pub fn with_backend(blobs: B) -> Self {
        Self {
            blobs,
            runs: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// The blob backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.blobs
    }

    fn ensure_run(&self, run_id: Uuid, build_id: &str) {
        self.runs.entry(run_id).or_insert_with(|| RunEntry {
            build_id: build_id.to_string(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            artifacts: BTreeMap::new(),
        });
    }

    async fn store(&self, run_id: Uuid, path: &str, bytes: Vec<u8>) -> Result<Artifact, ArtifactError> {
        let digest = sha256_hex(&bytes);
        let size = bytes.len() as u64;
        let locator = self.blobs.write(run_id, path, bytes).await?;
        let artifact = Artifact {
            id: Artifact::make_id(run_id, path),
            path: path.to_string(),
            locator,
            digest,
            size,
            run_id,
        };

        let replaced = self
            .runs
            .get_mut(&run_id)
            .and_then(|mut entry| entry.artifacts.insert(path.to_string(), artifact.clone()));
        if let Some(old) = replaced {
            if old.locator != artifact.locator {
                self.blobs.delete(&old.locator).await?;
            }
        }
        Ok(artifact)
    }

    async fn clear_namespaces(&self, run_id: Uuid, rules: &ArtifactRules) -> Result<(), ArtifactError> {
        let namespaces = rules.destinations();
        let removed: Vec<Artifact> = match self.runs.get_mut(&run_id) {
            Some(mut entry) => {
                let (gone, kept): (BTreeMap<_, _>, BTreeMap<_, _>) =
                    std::mem::take(&mut entry.artifacts)
                        .into_iter()
                        .partition(|(path, _)| {
                            namespaces.iter().any(|ns| {
                                ns.is_empty() || path == ns || path.starts_with(&format!("{ns}/"))
                            })
                        });
                entry.artifacts = kept;
                gone.into_values().collect()
            }
            None => Vec::new(),
        };

        for artifact in &removed {
            self.blobs.delete(&artifact.locator).await?;
        }
        if !removed.is_empty() {
            debug!(run_id = %run_id, removed = removed.len(), "Cleaned destination namespaces");
        }
        Ok(())
    }
}

#[async_trait]
impl<B: BlobBackend> ArtifactStore for CatalogStore<B> {
    async fn put(
        &self,
        run_id: Uuid,
        build_id: &str,
        local_root: &Path,
        rules: &ArtifactRules,
    ) -> Result<Publication, ArtifactError> {
        self.ensure_run(run_id, build_id);
        let (files, unmatched_rules) = scan_workspace(local_root, rules).await?;

        let mut artifacts = Vec::with_capacity(files.len());
        for file in files {
            let bytes = tokio::fs::read(&file.source).await?;
            artifacts.push(self.store(run_id, &file.logical_path, bytes).await?);
        }

        info!(
            run_id = %run_id,
            build_id = %build_id,
            published = artifacts.len(),
            "Published artifacts"
        );
        Ok(Publication {
            artifacts,
            unmatched_rules,
        })
    }

    async fn get(&self, id: &str) -> Result<Artifact, ArtifactError> {
        let not_found = || ArtifactError::NotFound { id: id.to_string() };
        let (run_id, path) = Artifact::parse_id(id).ok_or_else(not_found)?;
        self.runs
            .get(&run_id)
            .and_then(|entry| entry.artifacts.get(path).cloned())
            .ok_or_else(not_found)
    }

    async fn read(&self, id: &str) -> Result<Vec<u8>, ArtifactError> {
        let artifact = self.get(id).await?;
        self.blobs.read(&artifact.locator).await
    }

    async fn list(&self, run_id: Uuid) -> Result<Vec<Artifact>, ArtifactError> {
        Ok(self
            .runs
            .get(&run_id)
            .map(|entry| entry.artifacts.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn copy_into(
        &self,
        source: Uuid,
        dest: Uuid,
        dest_build: &str,
        rules: &ArtifactRules,
        clean_destination: bool,
    ) -> Result<Publication, ArtifactError> {
        let source_artifacts: BTreeMap<String, Artifact> = self
            .runs
            .get(&source)
            .map(|entry| entry.artifacts.clone())
            .unwrap_or_default();
        let applied = rules.apply(source_artifacts.keys().map(String::as_str));

        self.ensure_run(dest, dest_build);
        if clean_destination {
            self.clear_namespaces(dest, rules).await?;
        }

        let mut artifacts = Vec::with_capacity(applied.mapped.len());
        for (src_path, dest_path) in &applied.mapped {
            let Some(original) = source_artifacts.get(src_path) else {
                continue;
            };
            let bytes = self.blobs.read(&original.locator).await?;
            artifacts.push(self.store(dest, dest_path, bytes).await?);
        }

        info!(
            source = %source,
            dest = %dest,
            copied = artifacts.len(),
            "Copied dependency artifacts"
        );
        Ok(Publication {
            artifacts,
            unmatched_rules: applied.unmatched,
        })
    }

    async fn retain_latest(&self, build_id: &str, keep: usize) -> Result<Vec<Uuid>, ArtifactError> {
        let mut runs: Vec<(Uuid, u64)> = self
            .runs
            .iter()
            .filter(|entry| entry.build_id == build_id)
            .map(|entry| (*entry.key(), entry.seq))
            .collect();
        runs.sort_by(|a, b| b.1.cmp(&a.1));

        let mut pruned = Vec::new();
        for (run_id, _) in runs.into_iter().skip(keep) {
            if let Some((_, entry)) = self.runs.remove(&run_id) {
                for artifact in entry.artifacts.values() {
                    self.blobs.delete(&artifact.locator).await?;
                }
                self.blobs.purge_run(run_id).await?;
                pruned.push(run_id);
            }
        }

        if !pruned.is_empty() {
            info!(build_id = %build_id, pruned = pruned.len(), "Pruned old run artifacts");
        }
        Ok(pruned)
    }
}
