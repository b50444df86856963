//! Isolated execution environments for steps.
//!
//! [`ExecutionSandbox`] is the capability seam to a container runtime.
//! [`SandboxPool`] bounds how many sandboxes are held at once.

mod docker;
mod error;
mod pool;
mod process;

pub use docker::DockerSandbox;
pub use error::SandboxError;
pub use pool::{Lease, SandboxPool};
pub use process::ProcessSandbox;

use crate::core::ExecutionEnvironment;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// An acquired sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxHandle {
    /// Sandbox-issued id.
    pub id: u64,
    /// Image the sandbox runs.
    pub image: String,
}

/// Exit code and captured output of a command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    /// Process exit code; -1 when killed by a signal.
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl ExecOutput {
    /// A successful run with the given stdout.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Returns true for exit code 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Capability interface to an isolated execution environment.
#[async_trait]
pub trait ExecutionSandbox: Send + Sync {
    /// Acquires a sandbox for the environment.
    async fn acquire(&self, env: &ExecutionEnvironment) -> Result<SandboxHandle, SandboxError>;

    /// Runs a command (executable first) to completion.
    async fn exec(&self, handle: &SandboxHandle, command: &[String]) -> Result<ExecOutput, SandboxError>;

    /// Asks the running command to stop, forcing it after `grace`.
    async fn terminate(&self, handle: &SandboxHandle, grace: Duration) -> Result<(), SandboxError>;

    /// Releases the sandbox.
    async fn release(&self, handle: SandboxHandle) -> Result<(), SandboxError>;
}

/// Splits a run parameter line into arguments.
///
/// Single and double quotes group words; inside double quotes a backslash
/// escapes the next character.
#[must_use]
pub fn split_args(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_token = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some('"'), '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '"' | '\'') => {
                quote = Some(c);
                in_token = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        args.push(current);
    }
    args
}
