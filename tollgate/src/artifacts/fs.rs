//! Filesystem blob backend: one directory per run under a root.

use super::{ArtifactError, BlobBackend, CatalogStore};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Blob storage under `<root>/<run id>/<logical path>`.
#[derive(Debug, Clone)]
pub struct FsBlobs {
    root: PathBuf,
}

impl FsBlobs {
    /// Creates a backend rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The storage root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl BlobBackend for FsBlobs {
    async fn write(&self, run_id: Uuid, path: &str, bytes: Vec<u8>) -> Result<String, ArtifactError> {
        let target = self.root.join(run_id.to_string()).join(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes).await?;
        Ok(target.display().to_string())
    }

    async fn read(&self, locator: &str) -> Result<Vec<u8>, ArtifactError> {
        match tokio::fs::read(locator).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ArtifactError::NotFound {
                id: locator.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, locator: &str) -> Result<(), ArtifactError> {
        match tokio::fs::remove_file(locator).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn purge_run(&self, run_id: Uuid) -> Result<(), ArtifactError> {
        match tokio::fs::remove_dir_all(self.root.join(run_id.to_string())).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Artifact store writing content to disk.
pub type FsArtifactStore = CatalogStore<FsBlobs>;

impl FsArtifactStore {
    /// Creates a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_backend(FsBlobs::new(root))
    }
}
