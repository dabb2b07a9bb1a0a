// src/exec/mod.rs

//! Task execution callback.
//!
//! The scheduler hands every claimed task to a [`TaskExecutor`] together
//! with a [`CancelSignal`] and waits for its [`TaskOutcome`]. Production uses
//! [`ShellExecutor`]; tests plug in their own implementation.
//!
//! - [`shell`] runs a task's `cmd` through the platform shell.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::definitions::TaskDefinition;
use crate::state::TaskResult;
use crate::types::{RunId, TaskId};

pub mod shell;

pub use shell::ShellExecutor;

/// A claimed task, as handed to the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableTask {
    pub run_id: RunId,
    pub task_id: TaskId,
    /// 1-based; greater than 1 when earlier attempts failed.
    pub attempt: u32,
    pub definition: TaskDefinition,
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success(TaskResult),
    Failed(String),
    /// The execution observed its cancel signal and stopped.
    Cancelled,
}

/// Cancellation request delivered to a running execution.
///
/// Fires when the run is force-failed or the worker shuts down.
#[derive(Debug)]
pub struct CancelSignal {
    rx: Option<oneshot::Receiver<()>>,
    fired: bool,
}

impl CancelSignal {
    pub fn new(rx: oneshot::Receiver<()>) -> Self {
        Self {
            rx: Some(rx),
            fired: false,
        }
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        Self {
            rx: None,
            fired: false,
        }
    }

    /// Resolve once cancellation is requested.
    ///
    /// A dropped sender counts as a request: nobody is left to record the
    /// outcome.
    pub async fn cancelled(&mut self) {
        if self.fired {
            return;
        }
        match self.rx.as_mut() {
            Some(rx) => {
                let _ = rx.await;
                self.fired = true;
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Non-blocking check.
    pub fn is_cancelled(&mut self) -> bool {
        if self.fired {
            return true;
        }
        let Some(rx) = self.rx.as_mut() else {
            return false;
        };
        match rx.try_recv() {
            Ok(()) | Err(oneshot::error::TryRecvError::Closed) => {
                self.fired = true;
                true
            }
            Err(oneshot::error::TryRecvError::Empty) => false,
        }
    }
}

/// The execution callback.
pub trait TaskExecutor: Send + Sync + fmt::Debug {
    /// Execute one claimed task to completion.
    ///
    /// Implementations should return [`TaskOutcome::Cancelled`] promptly once
    /// `cancel` fires.
    fn execute(
        &self,
        task: ExecutableTask,
        cancel: CancelSignal,
    ) -> Pin<Box<dyn Future<Output = TaskOutcome> + Send + '_>>;
}

/// Shared, type-erased executor handle.
pub type SharedExecutor = Arc<dyn TaskExecutor>;
