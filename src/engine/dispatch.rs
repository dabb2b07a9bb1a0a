// src/engine/dispatch.rs

//! Bounded pool of task executions.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::exec::{CancelSignal, ExecutableTask, SharedExecutor, TaskOutcome};
use crate::types::{RunId, TaskId};

/// Reported back to the scheduler loop when an execution ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFinished {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub attempt: u32,
    pub outcome: TaskOutcome,
}

/// Internal handle for an execution in flight.
///
/// - `cancel` asks the execution to stop (run force-failed, shutdown).
/// - `handle` is the Tokio task driving the executor.
#[derive(Debug)]
struct ActiveTask {
    cancel: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

/// Runs claimed tasks concurrently, at most `pool_size` at a time.
///
/// Capacity is reserved before a task is claimed, so a worker never holds a
/// claim it has no slot to execute.
#[derive(Debug)]
pub struct Dispatcher {
    executor: SharedExecutor,
    permits: Arc<Semaphore>,
    active: HashMap<(RunId, TaskId), ActiveTask>,
    done_tx: mpsc::UnboundedSender<TaskFinished>,
}

impl Dispatcher {
    pub fn new(
        executor: SharedExecutor,
        pool_size: usize,
        done_tx: mpsc::UnboundedSender<TaskFinished>,
    ) -> Self {
        Self {
            executor,
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
            active: HashMap::new(),
            done_tx,
        }
    }

    /// Reserve a slot without waiting.
    pub fn try_reserve(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().try_acquire_owned().ok()
    }

    /// Start executing a claimed task on a reserved slot.
    pub fn dispatch(&mut self, permit: OwnedSemaphorePermit, task: ExecutableTask) {
        let key = (task.run_id.clone(), task.task_id.clone());
        if self.active.contains_key(&key) {
            warn!(run_id = %key.0, task = %key.1, "task already executing locally; not dispatching again");
            return;
        }

        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let executor = Arc::clone(&self.executor);
        let done_tx = self.done_tx.clone();

        let handle = tokio::spawn(async move {
            let run_id = task.run_id.clone();
            let task_id = task.task_id.clone();
            let attempt = task.attempt;

            let execution =
                tokio::spawn(async move { executor.execute(task, CancelSignal::new(cancel_rx)).await });
            let outcome = match execution.await {
                Ok(outcome) => outcome,
                Err(e) => TaskOutcome::Failed(format!("executor aborted: {e}")),
            };

            // Free the slot before reporting so the loop sees the capacity.
            drop(permit);
            debug!(run_id = %run_id, task = %task_id, ?outcome, "task execution finished");
            let _ = done_tx.send(TaskFinished {
                run_id,
                task_id,
                attempt,
                outcome,
            });
        });

        self.active.insert(
            key,
            ActiveTask {
                cancel: Some(cancel_tx),
                handle,
            },
        );
    }

    /// Forget a finished execution.
    pub fn finished(&mut self, run_id: &RunId, task_id: &TaskId) {
        self.active.remove(&(run_id.clone(), task_id.clone()));
    }

    pub fn is_running(&self, run_id: &RunId, task_id: &TaskId) -> bool {
        self.active.contains_key(&(run_id.clone(), task_id.clone()))
    }

    pub fn inflight(&self) -> usize {
        self.active.len()
    }

    pub fn inflight_for(&self, run_id: &RunId) -> usize {
        self.active.keys().filter(|(run, _)| run == run_id).count()
    }

    /// Runs with at least one local execution in flight.
    pub fn runs_with_inflight(&self) -> BTreeSet<RunId> {
        self.active.keys().map(|(run, _)| run.clone()).collect()
    }

    /// Ask every local execution of a run to stop. Returns how many were
    /// signalled.
    pub fn cancel_run(&mut self, run_id: &RunId) -> usize {
        let mut signalled = 0;
        for ((run, task), active) in self.active.iter_mut() {
            if run != run_id {
                continue;
            }
            if let Some(cancel) = active.cancel.take() {
                if cancel.send(()).is_ok() {
                    signalled += 1;
                } else {
                    debug!(run_id = %run, task = %task, "execution already finished while cancelling");
                }
            }
        }
        if signalled > 0 {
            info!(run_id = %run_id, signalled, "cancelled local task executions");
        }
        signalled
    }

    /// Ask every local execution to stop.
    pub fn cancel_all(&mut self) {
        for ((run, task), active) in self.active.iter_mut() {
            if let Some(cancel) = active.cancel.take() {
                if cancel.send(()).is_err() {
                    debug!(run_id = %run, task = %task, "execution already finished while cancelling");
                }
            }
        }
    }

    /// Abort every execution that is still running.
    pub fn abort_all(&mut self) {
        for (_, active) in self.active.drain() {
            active.handle.abort();
        }
    }
}
