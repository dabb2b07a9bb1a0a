use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flockdag::exec::{CancelSignal, ExecutableTask, TaskExecutor, TaskOutcome};
use flockdag::state::TaskResult;
use flockdag::types::{RunId, TaskId};
use tokio::sync::watch;

/// One call into the executor.
#[derive(Debug, Clone)]
pub struct Execution {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub attempt: u32,
    /// Global sequence number taken when the execution started.
    pub started_seq: u64,
    /// Global sequence number taken when the execution returned.
    pub finished_seq: Option<u64>,
    pub outcome: Option<TaskOutcome>,
}

impl Execution {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, Some(TaskOutcome::Success(_)))
    }
}

/// An executor that:
/// - records every execution with a global ordering,
/// - optionally sleeps before finishing,
/// - fails the first N attempts of selected tasks,
/// - blocks selected tasks until [`release`](Self::release) or cancellation.
#[derive(Debug, Clone)]
pub struct RecordingExecutor {
    executions: Arc<Mutex<Vec<Execution>>>,
    seq: Arc<AtomicU64>,
    delay: Duration,
    failures: Arc<Mutex<HashMap<TaskId, u32>>>,
    blocked: Arc<Mutex<HashSet<TaskId>>>,
    release: Arc<watch::Sender<bool>>,
}

impl Default for RecordingExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingExecutor {
    pub fn new() -> Self {
        let (release, _) = watch::channel(false);
        Self {
            executions: Arc::new(Mutex::new(Vec::new())),
            seq: Arc::new(AtomicU64::new(0)),
            delay: Duration::ZERO,
            failures: Arc::new(Mutex::new(HashMap::new())),
            blocked: Arc::new(Mutex::new(HashSet::new())),
            release: Arc::new(release),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail attempts `1..=times` of `task`.
    pub fn failing(self, task: &str, times: u32) -> Self {
        self.failures.lock().unwrap().insert(TaskId::from(task), times);
        self
    }

    /// Block every execution of `task` until released or cancelled.
    pub fn blocking(self, task: &str) -> Self {
        self.blocked.lock().unwrap().insert(TaskId::from(task));
        self
    }

    /// Let blocked executions finish.
    pub fn release(&self) {
        self.release.send_replace(true);
    }

    pub fn executions(&self) -> Vec<Execution> {
        self.executions.lock().unwrap().clone()
    }

    pub fn started_count(&self) -> usize {
        self.executions.lock().unwrap().len()
    }

    pub fn in_flight(&self) -> usize {
        self.executions
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.finished_seq.is_none())
            .count()
    }

    /// Number of executions of `task` in `run`.
    pub fn count(&self, run_id: &RunId, task: &str) -> usize {
        self.executions
            .lock()
            .unwrap()
            .iter()
            .filter(|e| &e.run_id == run_id && e.task_id.as_str() == task)
            .count()
    }

    /// Successful executions per (run, task).
    pub fn successes(&self) -> BTreeMap<(RunId, TaskId), usize> {
        let mut out = BTreeMap::new();
        for e in self.executions.lock().unwrap().iter().filter(|e| e.succeeded()) {
            *out.entry((e.run_id.clone(), e.task_id.clone())).or_insert(0) += 1;
        }
        out
    }

    /// Executions that ended cancelled.
    pub fn cancelled(&self) -> Vec<Execution> {
        self.executions
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e.outcome, Some(TaskOutcome::Cancelled)))
            .cloned()
            .collect()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn record_start(&self, task: &ExecutableTask) -> usize {
        let mut guard = self.executions.lock().unwrap();
        guard.push(Execution {
            run_id: task.run_id.clone(),
            task_id: task.task_id.clone(),
            attempt: task.attempt,
            started_seq: self.next_seq(),
            finished_seq: None,
            outcome: None,
        });
        guard.len() - 1
    }

    fn record_end(&self, idx: usize, outcome: TaskOutcome) -> TaskOutcome {
        let mut guard = self.executions.lock().unwrap();
        let seq = self.next_seq();
        if let Some(e) = guard.get_mut(idx) {
            e.finished_seq = Some(seq);
            e.outcome = Some(outcome.clone());
        }
        outcome
    }

    fn should_fail(&self, task: &ExecutableTask) -> bool {
        self.failures
            .lock()
            .unwrap()
            .get(&task.task_id)
            .is_some_and(|times| task.attempt <= *times)
    }

    fn is_blocked(&self, task: &TaskId) -> bool {
        self.blocked.lock().unwrap().contains(task)
    }
}

async fn wait_released(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|released| *released).await;
}

impl TaskExecutor for RecordingExecutor {
    fn execute(
        &self,
        task: ExecutableTask,
        mut cancel: CancelSignal,
    ) -> Pin<Box<dyn Future<Output = TaskOutcome> + Send + '_>> {
        Box::pin(async move {
            let idx = self.record_start(&task);

            if !self.delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.delay) => {}
                    _ = cancel.cancelled() => {
                        return self.record_end(idx, TaskOutcome::Cancelled);
                    }
                }
            }

            if self.is_blocked(&task.task_id) {
                let mut rx = self.release.subscribe();
                tokio::select! {
                    _ = wait_released(&mut rx) => {}
                    _ = cancel.cancelled() => {
                        return self.record_end(idx, TaskOutcome::Cancelled);
                    }
                }
            }

            let outcome = if self.should_fail(&task) {
                TaskOutcome::Failed(format!("injected failure of {} (attempt {})", task.task_id, task.attempt))
            } else {
                TaskOutcome::Success(TaskResult::with_message(format!("{} done", task.task_id)))
            };
            self.record_end(idx, outcome)
        })
    }
}
