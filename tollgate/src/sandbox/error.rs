//! Sandbox errors.

use thiserror::Error;

/// Errors raised by an [`ExecutionSandbox`](super::ExecutionSandbox).
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The image cannot be found or pulled. Not retryable.
    #[error("Image unavailable: {image}: {reason}")]
    ImageUnavailable {
        /// The image reference.
        image: String,
        /// Why it is unavailable.
        reason: String,
    },

    /// No execution slot is free. Retryable with backoff.
    #[error("Sandbox resources exhausted: {reason}")]
    ResourceExhausted {
        /// What ran out.
        reason: String,
    },

    /// The handle was never issued or was already released.
    #[error("Unknown sandbox handle: {id}")]
    UnknownHandle {
        /// Handle id.
        id: u64,
    },

    /// The command could not be started or awaited.
    #[error("Sandbox exec failed: {reason}")]
    Exec {
        /// Failure description.
        reason: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Returns true if the operation may succeed when retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. })
    }
}
