//! Execution of a single build step inside a sandbox.

mod logs;

pub use logs::LogStore;

use crate::cancellation::CancellationToken;
use crate::core::{ExecutionEnvironment, LogRef, StepDefinition, StepResult, StepStatus};
use crate::errors::ParameterError;
use crate::params::ParameterResolver;
use crate::pipeline::{retry_if, RetryPolicy};
use crate::sandbox::{ExecOutput, SandboxError, SandboxPool};
use crate::utils::{now_utc, Timestamp};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a step did not succeed.
#[derive(Debug, Error)]
pub enum StepError {
    /// The command ran past its timeout.
    #[error("Step '{step}' timed out after {timeout_secs}s")]
    Timeout {
        /// Step id.
        step: String,
        /// Configured timeout.
        timeout_secs: u64,
    },

    /// The command exited non-zero.
    #[error("Step '{step}' failed with exit code {exit_code}")]
    ExecutionFailed {
        /// Step id.
        step: String,
        /// Exit code.
        exit_code: i32,
    },

    /// The sandbox could not be acquired or could not run the command.
    #[error("Step '{step}': {source}")]
    Sandbox {
        /// Step id.
        step: String,
        /// Underlying error.
        #[source]
        source: SandboxError,
    },

    /// A `%name%` reference could not be resolved.
    #[error("Step '{step}': {source}")]
    Parameter {
        /// Step id.
        step: String,
        /// Underlying error.
        #[source]
        source: ParameterError,
    },

    /// The run was cancelled while the step was executing.
    #[error("Step '{step}' cancelled")]
    Cancelled {
        /// Step id.
        step: String,
    },
}

impl StepError {
    /// Machine-readable failure code recorded on the run.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "step_timeout",
            Self::ExecutionFailed { .. } => "step_failed",
            Self::Sandbox {
                source: SandboxError::ImageUnavailable { .. },
                ..
            } => "image_unavailable",
            Self::Sandbox {
                source: SandboxError::ResourceExhausted { .. },
                ..
            } => "resource_exhausted",
            Self::Sandbox { .. } => "sandbox_error",
            Self::Parameter { .. } => "parameter_unresolved",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

/// A step result plus the error behind a non-successful status.
#[derive(Debug)]
pub struct StepExecution {
    /// The recorded result.
    pub result: StepResult,
    /// Set for `Failed`, `TimedOut` and `Cancelled` results.
    pub error: Option<StepError>,
}

/// Run-scoped inputs of a step.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    /// The run executing the step.
    pub run_id: Uuid,
    /// Parameter lookup for the run.
    pub params: &'a ParameterResolver,
    /// The run's cancellation token.
    pub cancel: &'a CancellationToken,
    /// Working directory for host steps and the default mount.
    pub checkout_dir: &'a Path,
}

struct Prepared {
    command: Vec<String>,
    env: ExecutionEnvironment,
}

enum Outcome {
    Finished(Result<ExecOutput, SandboxError>),
    TimedOut(Option<ExecOutput>),
    Cancelled(Option<ExecOutput>),
}

/// Runs steps against a [`SandboxPool`].
#[derive(Debug, Clone)]
pub struct StepExecutor {
    pool: Arc<SandboxPool>,
    logs: Arc<LogStore>,
    retry: RetryPolicy,
    grace: Duration,
    default_timeout: Option<Duration>,
}

impl StepExecutor {
    /// Creates an executor with the default retry policy and a 10s grace period.
    #[must_use]
    pub fn new(pool: Arc<SandboxPool>, logs: Arc<LogStore>) -> Self {
        Self {
            pool,
            logs,
            retry: RetryPolicy::default(),
            grace: Duration::from_secs(10),
            default_timeout: None,
        }
    }

    /// Sets the acquisition retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the grace period between terminate and forced kill.
    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Sets the timeout for steps that declare none.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// The log store.
    #[must_use]
    pub fn logs(&self) -> &Arc<LogStore> {
        &self.logs
    }

    /// The sandbox pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<SandboxPool> {
        &self.pool
    }

    fn prepare(
        step: &StepDefinition,
        ctx: &StepContext<'_>,
        secrets: &mut BTreeSet<String>,
    ) -> Result<Prepared, ParameterError> {
        let command = step
            .kind
            .command_line()
            .iter()
            .map(|arg| ctx.params.resolve_with_secrets(arg, secrets))
            .collect::<Result<Vec<_>, _>>()?;

        let mut env = step.environment.clone().unwrap_or_default();
        env.image = ctx.params.resolve_with_secrets(&env.image, secrets)?;
        env.run_parameters = env
            .run_parameters
            .iter()
            .map(|p| ctx.params.resolve_with_secrets(p, secrets))
            .collect::<Result<Vec<_>, _>>()?;
        env.working_dir = Some(match &env.working_dir {
            Some(dir) => ctx.params.resolve_with_secrets(dir, secrets)?,
            None => ctx.checkout_dir.display().to_string(),
        });

        Ok(Prepared { command, env })
    }

    fn finish(
        step: &StepDefinition,
        started_at: Timestamp,
        status: StepStatus,
        exit_code: Option<i32>,
        log_ref: Option<LogRef>,
        attempts: u32,
        error: Option<StepError>,
    ) -> StepExecution {
        StepExecution {
            result: StepResult {
                step_id: step.id.clone(),
                status,
                exit_code,
                log_ref,
                attempts,
                message: error.as_ref().map(ToString::to_string),
                started_at,
                finished_at: now_utc(),
            },
            error,
        }
    }

    /// Executes one step. Never returns early without releasing the
    /// sandbox it acquired.
    pub async fn execute(&self, step: &StepDefinition, ctx: &StepContext<'_>) -> StepExecution {
        let started_at = now_utc();
        let mut secrets = BTreeSet::new();

        let Prepared { command, env } = match Self::prepare(step, ctx, &mut secrets) {
            Ok(prepared) => prepared,
            Err(source) => {
                warn!(run_id = %ctx.run_id, step_id = %step.id, error = %source, "Parameter resolution failed");
                let log_ref = self.logs.store_text(ctx.run_id, &step.id, &source.to_string(), &secrets);
                let error = StepError::Parameter {
                    step: step.id.clone(),
                    source,
                };
                return Self::finish(step, started_at, StepStatus::Failed, None, Some(log_ref), 0, Some(error));
            }
        };

        let cancelled = |attempts| {
            Self::finish(
                step,
                started_at,
                StepStatus::Cancelled,
                None,
                None,
                attempts,
                Some(StepError::Cancelled { step: step.id.clone() }),
            )
        };
        if ctx.cancel.is_cancelled() {
            return cancelled(0);
        }

        let acquired = retry_if(&self.retry, &step.id, SandboxError::is_retryable, || {
            self.pool.acquire_until(&env, ctx.cancel)
        })
        .await;
        let (lease, attempts) = match acquired {
            Ok((Some(lease), attempts)) => (lease, attempts),
            Ok((None, attempts)) => return cancelled(attempts),
            Err((source, attempts)) => {
                warn!(run_id = %ctx.run_id, step_id = %step.id, attempts, error = %source, "Sandbox acquisition failed");
                let log_ref = self.logs.store_text(ctx.run_id, &step.id, &source.to_string(), &secrets);
                let error = StepError::Sandbox {
                    step: step.id.clone(),
                    source,
                };
                return Self::finish(step, started_at, StepStatus::Failed, None, Some(log_ref), attempts, Some(error));
            }
        };

        let timeout = step
            .timeout_secs
            .map(Duration::from_secs)
            .or(self.default_timeout);
        info!(
            run_id = %ctx.run_id,
            step_id = %step.id,
            image = %lease.handle.image,
            attempts,
            "Step started"
        );

        let outcome = if ctx.cancel.is_cancelled() {
            Outcome::Cancelled(None)
        } else {
            let sandbox = self.pool.sandbox();
            let exec = sandbox.exec(&lease.handle, &command);
            tokio::pin!(exec);
            let deadline = async {
                match timeout {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending().await,
                }
            };
            tokio::pin!(deadline);

            let interrupted = tokio::select! {
                result = &mut exec => Err(result),
                () = &mut deadline => Ok(true),
                () = ctx.cancel.cancelled() => Ok(false),
            };

            match interrupted {
                Err(result) => Outcome::Finished(result),
                Ok(timed_out) => {
                    debug!(run_id = %ctx.run_id, step_id = %step.id, timed_out, "Terminating step");
                    if let Err(e) = sandbox.terminate(&lease.handle, self.grace).await {
                        warn!(step_id = %step.id, error = %e, "Terminate failed");
                    }
                    let partial = tokio::time::timeout(self.grace + Duration::from_secs(1), &mut exec)
                        .await
                        .ok()
                        .and_then(Result::ok);
                    if timed_out {
                        Outcome::TimedOut(partial)
                    } else {
                        Outcome::Cancelled(partial)
                    }
                }
            }
        };

        if let Err(e) = self.pool.release(lease).await {
            warn!(run_id = %ctx.run_id, step_id = %step.id, error = %e, "Sandbox release failed");
        }

        let store = |output: &ExecOutput| self.logs.store(ctx.run_id, &step.id, &command, output, &secrets);
        let execution = match outcome {
            Outcome::Finished(Ok(output)) => {
                let log_ref = Some(store(&output));
                if output.success() {
                    Self::finish(step, started_at, StepStatus::Success, Some(0), log_ref, attempts, None)
                } else {
                    let error = StepError::ExecutionFailed {
                        step: step.id.clone(),
                        exit_code: output.exit_code,
                    };
                    Self::finish(step, started_at, StepStatus::Failed, Some(output.exit_code), log_ref, attempts, Some(error))
                }
            }
            Outcome::Finished(Err(source)) => {
                let log_ref = self.logs.store_text(ctx.run_id, &step.id, &source.to_string(), &secrets);
                let error = StepError::Sandbox {
                    step: step.id.clone(),
                    source,
                };
                Self::finish(step, started_at, StepStatus::Failed, None, Some(log_ref), attempts, Some(error))
            }
            Outcome::TimedOut(partial) => {
                let log_ref = partial.as_ref().map(store);
                let error = StepError::Timeout {
                    step: step.id.clone(),
                    timeout_secs: timeout.map_or(0, |t| t.as_secs()),
                };
                Self::finish(step, started_at, StepStatus::TimedOut, None, log_ref, attempts, Some(error))
            }
            Outcome::Cancelled(partial) => {
                let log_ref = partial.as_ref().map(store);
                let error = StepError::Cancelled { step: step.id.clone() };
                Self::finish(step, started_at, StepStatus::Cancelled, None, log_ref, attempts, Some(error))
            }
        };

        info!(
            run_id = %ctx.run_id,
            step_id = %step.id,
            status = %execution.result.status,
            exit_code = ?execution.result.exit_code,
            "Step finished"
        );
        execution
    }
}
