//! Artifact publication, retrieval and propagation between runs.
//!
//! Artifacts are addressed by run id and logical path. Publishing scans a
//! run's checkout directory with [`ArtifactRules`]; dependencies copy a
//! subset of an upstream run's artifacts into the dependent run.

mod fs;
mod memory;
mod rules;
mod store;

pub use fs::{FsArtifactStore, FsBlobs};
pub use memory::{InMemoryArtifactStore, MemoryBlobs};
pub use rules::{ArtifactRules, RuleApplication, RuleParseError};
pub use store::{BlobBackend, CatalogStore};

use crate::core::Artifact;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Errors raised by artifact stores.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// Unknown artifact id.
    #[error("Artifact not found: {id}")]
    NotFound {
        /// The id looked up.
        id: String,
    },

    /// Include rules selected no file.
    #[error("Run {run_id}: artifact rules matched nothing: {}", patterns.join(", "))]
    PatternMatchedNothing {
        /// The rules that matched nothing.
        patterns: Vec<String>,
        /// The run being published or copied into.
        run_id: Uuid,
    },

    /// The rule string is malformed.
    #[error("{0}")]
    Rule(#[from] RuleParseError),

    /// A workspace path could not be mapped to a logical path.
    #[error("Invalid artifact path: {path}")]
    InvalidPath {
        /// The offending path.
        path: String,
    },

    /// The background workspace scan failed.
    #[error("Artifact scan failed: {0}")]
    Scan(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How rules that match nothing are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingArtifactPolicy {
    /// Log a warning and carry on.
    #[default]
    Warn,
    /// Treat as an error; a successful run becomes Failed.
    Fail,
}

impl MissingArtifactPolicy {
    /// Applies the policy to a publication or copy result.
    pub fn check(self, publication: &Publication, run_id: Uuid) -> Result<(), ArtifactError> {
        if publication.unmatched_rules.is_empty() {
            return Ok(());
        }
        match self {
            Self::Warn => {
                for pattern in &publication.unmatched_rules {
                    warn!(run_id = %run_id, pattern = %pattern, "Artifact rule matched nothing");
                }
                Ok(())
            }
            Self::Fail => Err(ArtifactError::PatternMatchedNothing {
                patterns: publication.unmatched_rules.clone(),
                run_id,
            }),
        }
    }
}

/// Result of a `put` or `copy_into`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Publication {
    /// Artifacts written.
    pub artifacts: Vec<Artifact>,
    /// Include rules that matched nothing.
    pub unmatched_rules: Vec<String>,
}

/// Storage of run artifacts.
///
/// Implementations must be safe for concurrent use across distinct run ids.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Publishes the files under `local_root` selected by `rules`.
    async fn put(
        &self,
        run_id: Uuid,
        build_id: &str,
        local_root: &Path,
        rules: &ArtifactRules,
    ) -> Result<Publication, ArtifactError>;

    /// Looks up an artifact by id.
    async fn get(&self, id: &str) -> Result<Artifact, ArtifactError>;

    /// Reads an artifact's content.
    async fn read(&self, id: &str) -> Result<Vec<u8>, ArtifactError>;

    /// All artifacts of a run, ordered by path.
    async fn list(&self, run_id: Uuid) -> Result<Vec<Artifact>, ArtifactError>;

    /// Copies the artifacts of `source` selected by `rules` into `dest`.
    ///
    /// With `clean_destination`, each rule's destination namespace in
    /// `dest` is emptied first.
    async fn copy_into(
        &self,
        source: Uuid,
        dest: Uuid,
        dest_build: &str,
        rules: &ArtifactRules,
        clean_destination: bool,
    ) -> Result<Publication, ArtifactError>;

    /// Deletes the artifacts of all but the newest `keep` runs of a build.
    /// Returns the pruned run ids.
    async fn retain_latest(&self, build_id: &str, keep: usize) -> Result<Vec<Uuid>, ArtifactError>;
}

/// A workspace file selected for publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SelectedFile {
    pub(crate) source: PathBuf,
    pub(crate) logical_path: String,
}

/// Walks `root` and applies `rules` to every file's relative path.
pub(crate) async fn scan_workspace(
    root: &Path,
    rules: &ArtifactRules,
) -> Result<(Vec<SelectedFile>, Vec<String>), ArtifactError> {
    let root = root.to_path_buf();
    let rules = rules.clone();

    tokio::task::spawn_blocking(move || {
        let mut relative = Vec::new();
        if root.is_dir() {
            walk(&root, &root, &mut relative)?;
        }
        relative.sort();

        let applied = rules.apply(relative.iter().map(String::as_str));
        let files = applied
            .mapped
            .into_iter()
            .map(|(src, logical_path)| SelectedFile {
                source: root.join(&src),
                logical_path,
            })
            .collect();
        Ok((files, applied.unmatched))
    })
    .await
    .map_err(|e| ArtifactError::Scan(e.to_string()))?
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<(), ArtifactError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(root, &path, out)?;
        } else if file_type.is_file() {
            let rel = path.strip_prefix(root).map_err(|_| ArtifactError::InvalidPath {
                path: path.display().to_string(),
            })?;
            let logical = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push(logical);
        }
    }
    Ok(())
}
