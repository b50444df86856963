//! In-memory blob backend.

use super::{ArtifactError, BlobBackend, CatalogStore};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Blob storage in a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryBlobs {
    blobs: DashMap<String, Arc<Vec<u8>>>,
}

impl MemoryBlobs {
    /// Number of stored blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobBackend for MemoryBlobs {
    async fn write(&self, run_id: Uuid, path: &str, bytes: Vec<u8>) -> Result<String, ArtifactError> {
        let locator = format!("mem://{run_id}/{path}");
        self.blobs.insert(locator.clone(), Arc::new(bytes));
        Ok(locator)
    }

    async fn read(&self, locator: &str) -> Result<Vec<u8>, ArtifactError> {
        self.blobs
            .get(locator)
            .map(|blob| blob.as_ref().clone())
            .ok_or_else(|| ArtifactError::NotFound {
                id: locator.to_string(),
            })
    }

    async fn delete(&self, locator: &str) -> Result<(), ArtifactError> {
        self.blobs.remove(locator);
        Ok(())
    }
}

/// Artifact store holding everything in memory.
pub type InMemoryArtifactStore = CatalogStore<MemoryBlobs>;

impl InMemoryArtifactStore {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_backend(MemoryBlobs::default())
    }
}

impl Default for InMemoryArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}
