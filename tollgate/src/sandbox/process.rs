//! Host process sandbox: runs commands directly with `tokio::process`.
//!
//! The environment's image is recorded only. `--env K=V` / `-e K=V` run
//! parameters become environment variables; other parameters are ignored.

use super::{split_args, ExecOutput, ExecutionSandbox, SandboxError, SandboxHandle};
use crate::core::ExecutionEnvironment;
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Slot {
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    pid: Option<u32>,
}

/// Runs steps as local processes.
#[derive(Debug, Default)]
pub struct ProcessSandbox {
    next_id: AtomicU64,
    slots: DashMap<u64, Slot>,
}

/// Extracts `--env K=V` and `-e K=V` pairs from run parameters.
pub(crate) fn env_from_run_parameters(params: &[String]) -> Vec<(String, String)> {
    let mut vars = Vec::new();
    for line in params {
        let args = split_args(line);
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            let pair = if arg == "--env" || arg == "-e" {
                iter.next().map(String::as_str)
            } else {
                arg.strip_prefix("--env=")
            };
            if let Some((key, value)) = pair.and_then(|p| p.split_once('=')) {
                vars.push((key.to_string(), value.to_string()));
            }
        }
    }
    vars
}

impl ProcessSandbox {
    /// Creates a process sandbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, handle: &SandboxHandle) -> Result<Slot, SandboxError> {
        self.slots
            .get(&handle.id)
            .map(|slot| slot.clone())
            .ok_or(SandboxError::UnknownHandle { id: handle.id })
    }
}

/// Sends `signal` to a step process. A process that already exited is not
/// an error.
#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        warn!(pid, "Process id out of range, not signalled");
        return;
    };
    match nix::sys::signal::kill(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, signal = ?signal, error = %e, "Failed to signal process"),
    }
}

#[cfg(unix)]
fn request_stop(pid: u32) {
    send_signal(pid, nix::sys::signal::Signal::SIGTERM);
}

#[cfg(unix)]
fn force_kill(pid: u32) {
    send_signal(pid, nix::sys::signal::Signal::SIGKILL);
}

// Without signals the child is killed when its exec future is dropped.
#[cfg(not(unix))]
fn request_stop(pid: u32) {
    debug!(pid, "No graceful stop on this platform");
}

#[cfg(not(unix))]
fn force_kill(pid: u32) {
    debug!(pid, "No forced kill on this platform");
}

#[async_trait]
impl ExecutionSandbox for ProcessSandbox {
    async fn acquire(&self, env: &ExecutionEnvironment) -> Result<SandboxHandle, SandboxError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.slots.insert(
            id,
            Slot {
                working_dir: env.working_dir.as_ref().map(PathBuf::from),
                env: env_from_run_parameters(&env.run_parameters),
                pid: None,
            },
        );
        Ok(SandboxHandle {
            id,
            image: env.image.clone(),
        })
    }

    async fn exec(&self, handle: &SandboxHandle, command: &[String]) -> Result<ExecOutput, SandboxError> {
        let slot = self.slot(handle)?;
        let (program, args) = command.split_first().ok_or_else(|| SandboxError::Exec {
            reason: "empty command".to_string(),
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &slot.working_dir {
            if !dir.exists() {
                tokio::fs::create_dir_all(dir).await?;
            }
            cmd.current_dir(dir);
        }
        for (key, value) in &slot.env {
            cmd.env(key, value);
        }

        let child = cmd.spawn().map_err(|e| SandboxError::Exec {
            reason: format!("failed to spawn '{program}': {e}"),
        })?;
        if let Some(mut entry) = self.slots.get_mut(&handle.id) {
            entry.pid = child.id();
        }
        debug!(handle = handle.id, program = %program, pid = ?child.id(), "Spawned step process");

        let output = child.wait_with_output().await?;
        if let Some(mut entry) = self.slots.get_mut(&handle.id) {
            entry.pid = None;
        }

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn terminate(&self, handle: &SandboxHandle, grace: Duration) -> Result<(), SandboxError> {
        let Some(pid) = self.slot(handle)?.pid else {
            return Ok(());
        };
        request_stop(pid);

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if self.slot(handle)?.pid.is_none() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if self.slot(handle)?.pid.is_some() {
            warn!(pid, "Process ignored SIGTERM, killing");
            force_kill(pid);
        }
        Ok(())
    }

    async fn release(&self, handle: SandboxHandle) -> Result<(), SandboxError> {
        self.slots
            .remove(&handle.id)
            .map(|_| ())
            .ok_or(SandboxError::UnknownHandle { id: handle.id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_env_from_run_parameters() {
        let params = vec![
            r#"--env "DOCKER_AUTH_CONFIG={}""#.to_string(),
            "-e A=1 -v /x:/x".to_string(),
            "--env=B=2".to_string(),
        ];
        assert_eq!(
            env_from_run_parameters(&params),
            vec![
                ("DOCKER_AUTH_CONFIG".to_string(), "{}".to_string()),
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "2".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_exec_captures_output_and_exit_code() {
        let sandbox = ProcessSandbox::new();
        let env = ExecutionEnvironment::default().with_run_parameters("--env GREETING=hello");
        let handle = sandbox.acquire(&env).await.unwrap();

        let out = sandbox
            .exec(&handle, &cmd(&["sh", "-c", "echo $GREETING; echo oops >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");

        sandbox.release(handle.clone()).await.unwrap();
        assert!(matches!(
            sandbox.release(handle).await,
            Err(SandboxError::UnknownHandle { .. })
        ));
    }

    #[tokio::test]
    async fn test_terminate_stops_running_command() {
        let sandbox = Arc::new(ProcessSandbox::new());
        let handle = sandbox.acquire(&ExecutionEnvironment::default()).await.unwrap();

        let running = {
            let sandbox = sandbox.clone();
            let handle = handle.clone();
            tokio::spawn(async move { sandbox.exec(&handle, &cmd(&["sleep", "30"])).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        sandbox.terminate(&handle, Duration::from_millis(500)).await.unwrap();

        let out = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_ne!(out.exit_code, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_kills_process_ignoring_sigterm() {
        let sandbox = Arc::new(ProcessSandbox::new());
        let handle = sandbox.acquire(&ExecutionEnvironment::default()).await.unwrap();

        let running = {
            let sandbox = sandbox.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                sandbox
                    .exec(&handle, &cmd(&["sh", "-c", "trap '' TERM; while true; do :; done"]))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        sandbox.terminate(&handle, Duration::from_millis(300)).await.unwrap();

        let out = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(out.exit_code, -1);
        assert!(sandbox.slot(&handle).unwrap().pid.is_none());
    }

    #[tokio::test]
    async fn test_terminate_without_process_is_noop() {
        let sandbox = ProcessSandbox::new();
        let handle = sandbox.acquire(&ExecutionEnvironment::default()).await.unwrap();
        sandbox.terminate(&handle, Duration::from_millis(10)).await.unwrap();
        sandbox.release(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let sandbox = ProcessSandbox::new();
        let handle = sandbox.acquire(&ExecutionEnvironment::default()).await.unwrap();
        let err = sandbox
            .exec(&handle, &cmd(&["/definitely/not/a/binary"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Exec { .. }));
    }
}
