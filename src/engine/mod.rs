// src/engine/mod.rs

//! Leaderless workflow scheduler.
//!
//! Every worker runs the same loop against the shared namespace. Atomic
//! create-if-absent is the only arbitration point: racing workers either win
//! a write or observe the winner's marker and move on.
//!
//! The pure per-run decision logic lives in [`core`]; [`dispatch`] runs
//! claimed tasks on a bounded pool; [`scheduler`] is the async loop;
//! [`manager`] owns one worker's session and loop; [`events`] broadcasts
//! lifecycle notifications.

use std::time::Duration;

use crate::config::ConfigSection;
use crate::coord::{Namespace, RetryPolicy};

pub mod core;
pub mod dispatch;
pub mod events;
pub mod manager;
pub mod scheduler;

pub use self::core::{decide, due_occurrence, ReadyTask, RunDecision, RunPhase};
pub use dispatch::{Dispatcher, TaskFinished};
pub use events::{EventBus, WorkflowEvent};
pub use manager::WorkflowManager;
pub use scheduler::Scheduler;

/// Tunables of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerOptions {
    pub poll_interval: Duration,
    pub lock_timeout: Duration,
    pub dispatch_pool_size: usize,
    pub max_concurrent_runs: usize,
    /// `0` retries failed tasks forever.
    pub max_task_attempts: u32,
    pub namespace: Namespace,
    pub retry: RetryPolicy,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from(&ConfigSection::default())
    }
}

impl From<&ConfigSection> for SchedulerOptions {
    fn from(c: &ConfigSection) -> Self {
        Self {
            poll_interval: Duration::from_millis(c.poll_interval_ms),
            lock_timeout: Duration::from_millis(c.lock_timeout_ms),
            dispatch_pool_size: c.dispatch_pool_size.max(1),
            max_concurrent_runs: c.max_concurrent_runs.max(1),
            max_task_attempts: c.max_task_attempts,
            namespace: Namespace::new(c.namespace.clone()),
            retry: RetryPolicy {
                max_attempts: c.retry_attempts.max(1),
                base_delay: Duration::from_millis(c.retry_backoff_ms),
                max_delay: Duration::from_millis(c.retry_backoff_max_ms),
            },
        }
    }
}
