//! Scripted sandbox for testing.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::core::ExecutionEnvironment;
use crate::sandbox::{ExecOutput, ExecutionSandbox, SandboxError, SandboxHandle};

/// What a scripted command does.
#[derive(Debug, Clone)]
pub enum Script {
    /// Exits immediately.
    Exit {
        /// Exit code.
        code: i32,
        /// Stdout.
        stdout: String,
    },
    /// Sleeps, then exits 0. Terminable.
    Sleep(Duration),
    /// Runs until terminated.
    Hang,
    /// Writes a file relative to the working directory, then exits 0.
    Write {
        /// Relative path.
        path: String,
        /// File content.
        content: String,
    },
}

impl Script {
    /// Exit with a code and no output.
    #[must_use]
    pub fn exit(code: i32) -> Self {
        Self::Exit {
            code,
            stdout: String::new(),
        }
    }

    /// Exit 0 printing `stdout`.
    #[must_use]
    pub fn print(stdout: impl Into<String>) -> Self {
        Self::Exit {
            code: 0,
            stdout: stdout.into(),
        }
    }

    /// Write a file, then exit 0.
    #[must_use]
    pub fn write(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Write {
            path: path.into(),
            content: content.into(),
        }
    }
}

struct HandleState {
    env: ExecutionEnvironment,
    stop: Arc<Notify>,
    stopped: Arc<AtomicBool>,
}

/// A sandbox whose commands follow scripts matched by substring.
///
/// Commands matching no script exit 0 with stdout `ok`.
#[derive(Default)]
pub struct MockSandbox {
    scripts: Mutex<Vec<(String, Script)>>,
    unavailable: Mutex<HashSet<String>>,
    exhaust_next: AtomicU32,
    next_id: AtomicU64,
    handles: DashMap<u64, HandleState>,
    acquired: AtomicUsize,
    released: AtomicUsize,
    terminated: AtomicUsize,
    acquire_attempts: AtomicUsize,
    commands: Mutex<Vec<Vec<String>>>,
    environments: Mutex<Vec<ExecutionEnvironment>>,
}

impl std::fmt::Debug for MockSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSandbox")
            .field("acquired", &self.acquired())
            .field("released", &self.released())
            .field("terminated", &self.terminated())
            .finish()
    }
}

impl MockSandbox {
    /// Creates a sandbox where every command succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts commands containing `pattern`. Earlier scripts win.
    #[must_use]
    pub fn on(self, pattern: impl Into<String>, script: Script) -> Self {
        self.scripts.lock().push((pattern.into(), script));
        self
    }

    /// Makes acquisition of `image` fail with `ImageUnavailable`.
    #[must_use]
    pub fn with_unavailable_image(self, image: impl Into<String>) -> Self {
        self.unavailable.lock().insert(image.into());
        self
    }

    /// Makes the next `n` acquisitions fail with `ResourceExhausted`.
    #[must_use]
    pub fn exhausted_for(self, n: u32) -> Self {
        self.exhaust_next.store(n, Ordering::SeqCst);
        self
    }

    /// Successful acquisitions.
    #[must_use]
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Acquisition attempts, failed ones included.
    #[must_use]
    pub fn acquire_attempts(&self) -> usize {
        self.acquire_attempts.load(Ordering::SeqCst)
    }

    /// Releases.
    #[must_use]
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Handles acquired and not yet released.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.handles.len()
    }

    /// Terminate calls.
    #[must_use]
    pub fn terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Every command executed, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().clone()
    }

    /// Commands joined with spaces.
    #[must_use]
    pub fn command_lines(&self) -> Vec<String> {
        self.commands().iter().map(|c| c.join(" ")).collect()
    }

    /// Environments passed to `acquire`, in order.
    #[must_use]
    pub fn environments(&self) -> Vec<ExecutionEnvironment> {
        self.environments.lock().clone()
    }

    fn script_for(&self, line: &str) -> Option<Script> {
        self.scripts
            .lock()
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, script)| script.clone())
    }
}

#[async_trait]
impl ExecutionSandbox for MockSandbox {
    async fn acquire(&self, env: &ExecutionEnvironment) -> Result<SandboxHandle, SandboxError> {
        self.acquire_attempts.fetch_add(1, Ordering::SeqCst);
        self.environments.lock().push(env.clone());

        if self.unavailable.lock().contains(&env.image) {
            return Err(SandboxError::ImageUnavailable {
                image: env.image.clone(),
                reason: "manifest unknown".to_string(),
            });
        }
        let exhausted = self
            .exhaust_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if exhausted {
            return Err(SandboxError::ResourceExhausted {
                reason: "no executor available".to_string(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.handles.insert(
            id,
            HandleState {
                env: env.clone(),
                stop: Arc::new(Notify::new()),
                stopped: Arc::new(AtomicBool::new(false)),
            },
        );
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(SandboxHandle {
            id,
            image: env.image.clone(),
        })
    }

    async fn exec(&self, handle: &SandboxHandle, command: &[String]) -> Result<ExecOutput, SandboxError> {
        let (env, stop, stopped) = self
            .handles
            .get(&handle.id)
            .map(|h| (h.env.clone(), h.stop.clone(), h.stopped.clone()))
            .ok_or(SandboxError::UnknownHandle { id: handle.id })?;
        self.commands.lock().push(command.to_vec());

        let line = command.join(" ");
        let terminated = || ExecOutput {
            exit_code: 143,
            stdout: String::new(),
            stderr: "terminated".to_string(),
        };

        match self.script_for(&line) {
            None => Ok(ExecOutput::ok("ok")),
            Some(Script::Exit { code, stdout }) => Ok(ExecOutput {
                exit_code: code,
                stdout,
                stderr: String::new(),
            }),
            Some(script @ (Script::Sleep(_) | Script::Hang)) => {
                let notified = stop.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if stopped.load(Ordering::SeqCst) {
                    return Ok(terminated());
                }
                match script {
                    Script::Sleep(duration) => tokio::select! {
                        () = tokio::time::sleep(duration) => Ok(ExecOutput::ok("slept")),
                        () = &mut notified => Ok(terminated()),
                    },
                    _ => {
                        notified.await;
                        Ok(terminated())
                    }
                }
            }
            Some(Script::Write { path, content }) => {
                let dir = env.working_dir.map(PathBuf::from).unwrap_or_default();
                let target = dir.join(path);
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&target, content).await?;
                Ok(ExecOutput::ok(format!("wrote {}", target.display())))
            }
        }
    }

    async fn terminate(&self, handle: &SandboxHandle, _grace: Duration) -> Result<(), SandboxError> {
        let state = self
            .handles
            .get(&handle.id)
            .ok_or(SandboxError::UnknownHandle { id: handle.id })?;
        state.stopped.store(true, Ordering::SeqCst);
        state.stop.notify_waiters();
        self.terminated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&self, handle: SandboxHandle) -> Result<(), SandboxError> {
        self.handles
            .remove(&handle.id)
            .ok_or(SandboxError::UnknownHandle { id: handle.id })?;
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
