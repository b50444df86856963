//! Artifact handles returned by the artifact store.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stored build output.
///
/// Artifacts are owned by the [`ArtifactStore`](crate::artifacts::ArtifactStore);
/// runs only keep copies of these handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Store-wide id, `<run id>:<logical path>`.
    pub id: String,
    /// Logical path inside the run namespace, `/` separated.
    pub path: String,
    /// Backing storage locator (`mem://...` or a filesystem path).
    pub locator: String,
    /// Hex sha256 of the content.
    pub digest: String,
    /// Size in bytes.
    pub size: u64,
    /// The run the artifact belongs to.
    pub run_id: Uuid,
}

impl Artifact {
    /// Builds the store-wide id of a logical path within a run.
    #[must_use]
    pub fn make_id(run_id: Uuid, path: &str) -> String {
        format!("{run_id}:{path}")
    }

    /// Splits an artifact id into run id and logical path.
    #[must_use]
    pub fn parse_id(id: &str) -> Option<(Uuid, &str)> {
        let (run, path) = id.split_once(':')?;
        let run_id = Uuid::parse_str(run).ok()?;
        Some((run_id, path))
    }
}
