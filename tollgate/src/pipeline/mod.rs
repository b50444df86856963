//! Build ordering and run execution.
//!
//! This module provides:
//! - Dependency ordering with cycle detection
//! - The shared run store
//! - The per-run scheduler
//! - Retry policies for transient failures

mod resolver;
mod retry;
mod run_store;
mod scheduler;

#[cfg(test)]
mod integration_tests;

pub use resolver::{resolve, resolve_all};
pub use retry::{retry_if, BackoffStrategy, JitterStrategy, RetryPolicy};
pub use run_store::RunStore;
pub use scheduler::PipelineScheduler;
