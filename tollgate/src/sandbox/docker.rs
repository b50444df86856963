//! Docker CLI sandbox.
//!
//! Each `exec` becomes one `docker run --rm` of the environment's image.
//! Run parameters are passed through to `docker run` verbatim; the working
//! directory is bind-mounted at the same path. Host environments (no
//! image) run as local processes.

use super::{split_args, ExecOutput, ExecutionSandbox, ProcessSandbox, SandboxError, SandboxHandle};
use crate::core::ExecutionEnvironment;
use async_trait::async_trait;
use dashmap::DashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Runs steps in containers through the `docker` CLI.
#[derive(Debug)]
pub struct DockerSandbox {
    binary: String,
    pull_missing: bool,
    next_id: AtomicU64,
    containers: DashMap<u64, ExecutionEnvironment>,
    host: ProcessSandbox,
    host_handles: DashMap<u64, SandboxHandle>,
}

impl Default for DockerSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerSandbox {
    /// Uses `docker` from `PATH` and pulls missing images.
    #[must_use]
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
            pull_missing: true,
            next_id: AtomicU64::new(0),
            containers: DashMap::new(),
            host: ProcessSandbox::new(),
            host_handles: DashMap::new(),
        }
    }

    /// Uses another CLI binary (e.g. `podman`).
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Disables pulling of images missing locally.
    #[must_use]
    pub fn without_pull(mut self) -> Self {
        self.pull_missing = false;
        self
    }

    /// Name given to the container of a handle.
    #[must_use]
    pub fn container_name(id: u64) -> String {
        format!("tollgate-{}-{id}", std::process::id())
    }

    /// Arguments after the binary for running `command` in `env`.
    #[must_use]
    pub fn run_args(id: u64, env: &ExecutionEnvironment, command: &[String]) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            Self::container_name(id),
        ];
        if let Some(dir) = &env.working_dir {
            args.extend(["-v".to_string(), format!("{dir}:{dir}"), "-w".to_string(), dir.clone()]);
        }
        for line in &env.run_parameters {
            args.extend(split_args(line));
        }
        args.push(env.image.clone());
        args.extend(command.iter().cloned());
        args
    }

    async fn docker(&self, args: &[&str]) -> Result<std::process::Output, SandboxError> {
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| SandboxError::Exec {
                reason: format!("failed to run {}: {e}", self.binary),
            })
    }

    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        let inspect = self.docker(&["image", "inspect", image]).await?;
        if inspect.status.success() {
            return Ok(());
        }
        if !self.pull_missing {
            return Err(SandboxError::ImageUnavailable {
                image: image.to_string(),
                reason: "image not present locally".to_string(),
            });
        }

        info!(image = %image, "Pulling image");
        let pull = self.docker(&["pull", image]).await?;
        if pull.status.success() {
            return Ok(());
        }
        Err(SandboxError::ImageUnavailable {
            image: image.to_string(),
            reason: String::from_utf8_lossy(&pull.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl ExecutionSandbox for DockerSandbox {
    async fn acquire(&self, env: &ExecutionEnvironment) -> Result<SandboxHandle, SandboxError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        if env.is_host() {
            let inner = self.host.acquire(env).await?;
            self.host_handles.insert(id, inner);
        } else {
            self.ensure_image(&env.image).await?;
            self.containers.insert(id, env.clone());
        }
        Ok(SandboxHandle {
            id,
            image: env.image.clone(),
        })
    }

    async fn exec(&self, handle: &SandboxHandle, command: &[String]) -> Result<ExecOutput, SandboxError> {
        if let Some(inner) = self.host_handles.get(&handle.id).map(|h| h.clone()) {
            return self.host.exec(&inner, command).await;
        }
        let env = self
            .containers
            .get(&handle.id)
            .map(|e| e.clone())
            .ok_or(SandboxError::UnknownHandle { id: handle.id })?;

        let args = Self::run_args(handle.id, &env, command);
        debug!(handle = handle.id, image = %env.image, "docker {}", args.join(" "));

        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SandboxError::Exec {
                reason: format!("failed to run {}: {e}", self.binary),
            })?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn terminate(&self, handle: &SandboxHandle, grace: Duration) -> Result<(), SandboxError> {
        if let Some(inner) = self.host_handles.get(&handle.id).map(|h| h.clone()) {
            return self.host.terminate(&inner, grace).await;
        }
        if !self.containers.contains_key(&handle.id) {
            return Err(SandboxError::UnknownHandle { id: handle.id });
        }

        let name = Self::container_name(handle.id);
        let secs = grace.as_secs().max(1).to_string();
        let stop = self.docker(&["stop", "-t", &secs, &name]).await?;
        if !stop.status.success() {
            warn!(container = %name, "docker stop failed, forcing removal");
            self.docker(&["rm", "-f", &name]).await?;
        }
        Ok(())
    }

    async fn release(&self, handle: SandboxHandle) -> Result<(), SandboxError> {
        if let Some((_, inner)) = self.host_handles.remove(&handle.id) {
            return self.host.release(inner).await;
        }
        self.containers
            .remove(&handle.id)
            .map(|_| ())
            .ok_or(SandboxError::UnknownHandle { id: handle.id })
    }
}
