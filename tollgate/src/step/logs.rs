//! Captured step output.

use crate::core::LogRef;
use crate::params::mask_secrets;
use crate::sandbox::ExecOutput;
use dashmap::DashMap;
use std::collections::BTreeSet;
use uuid::Uuid;

/// In-memory store of step logs keyed by [`LogRef`].
///
/// Secret values are masked before anything is stored.
#[derive(Debug, Default)]
pub struct LogStore {
    logs: DashMap<LogRef, String>,
}

impl LogStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the output of a step and returns its reference.
    pub fn store(
        &self,
        run_id: Uuid,
        step_id: &str,
        command: &[String],
        output: &ExecOutput,
        secrets: &BTreeSet<String>,
    ) -> LogRef {
        let mut text = format!("$ {}\n", command.join(" "));
        text.push_str(&output.stdout);
        if !output.stderr.is_empty() {
            if !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&output.stderr);
        }
        self.store_text(run_id, step_id, &text, secrets)
    }

    /// Stores free-form text for a step.
    pub fn store_text(&self, run_id: Uuid, step_id: &str, text: &str, secrets: &BTreeSet<String>) -> LogRef {
        let log_ref = LogRef::for_step(run_id, step_id);
        self.logs.insert(log_ref.clone(), mask_secrets(text, secrets));
        log_ref
    }

    /// Returns a stored log.
    #[must_use]
    pub fn get(&self, log_ref: &LogRef) -> Option<String> {
        self.logs.get(log_ref).map(|log| log.clone())
    }

    /// Drops every log of a run. Returns how many were removed.
    pub fn evict_run(&self, run_id: Uuid) -> usize {
        let prefix = format!("{run_id}/");
        let before = self.logs.len();
        self.logs.retain(|log_ref, _| !log_ref.0.starts_with(&prefix));
        before - self.logs.len()
    }

    /// Number of stored logs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.logs.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }
}
