// src/engine/scheduler.rs

//! The worker loop.
//!
//! Each iteration:
//!
//! 1. evaluates schedules under the distributed lock and races to create
//!    due runs,
//! 2. progresses active runs: reads their state, asks [`decide`] what to do
//!    and carries it out (claim, complete, cancel),
//! 3. waits for the earliest of the poll interval, a watch notification, a
//!    finished execution or shutdown.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::coord::{CoordError, DistributedLock, WatchEvent, WatchKind};
use crate::dag::{DagGraph, DagSnapshot};
use crate::definitions::{DefinitionSource, Definitions, ScheduleDefinition};
use crate::engine::core::{decide, due_occurrence, ReadyTask, RunDecision};
use crate::engine::dispatch::{Dispatcher, TaskFinished};
use crate::engine::events::{EventBus, WorkflowEvent};
use crate::engine::SchedulerOptions;
use crate::errors::{FlockError, Result};
use crate::exec::{ExecutableTask, SharedExecutor, TaskOutcome};
use crate::state::{
    ClaimOutcome, CreateRunOutcome, RunState, RunStateStore, TaskResult, TerminalReason,
};
use crate::types::{RunId, TaskId};

/// Time given to in-flight executions to react to cancellation on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// One worker's scheduling loop.
pub struct Scheduler {
    store: RunStateStore,
    definitions: Arc<dyn DefinitionSource>,
    options: SchedulerOptions,
    events: EventBus,
    dispatcher: Dispatcher,
    done_rx: mpsc::UnboundedReceiver<TaskFinished>,
    wake_tx: mpsc::UnboundedSender<WatchEvent>,
    wake_rx: mpsc::UnboundedReceiver<WatchEvent>,
    shutdown: watch::Receiver<bool>,
    /// Watches registered and not yet fired, with the task forwarding each.
    armed: HashMap<(String, WatchKind), JoinHandle<()>>,
    /// Validated graphs of runs seen so far.
    graphs: HashMap<RunId, DagGraph>,
    /// Runs whose cancellation this worker has already handled.
    canceled: HashSet<RunId>,
    /// Terminal runs without local executions; not re-read until cleaned.
    settled: HashSet<RunId>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("instance", &self.store.instance_id())
            .field("options", &self.options)
            .field("inflight", &self.dispatcher.inflight())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(
        store: RunStateStore,
        definitions: Arc<dyn DefinitionSource>,
        executor: SharedExecutor,
        options: SchedulerOptions,
        events: EventBus,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(executor, options.dispatch_pool_size, done_tx);

        Self {
            store,
            definitions,
            options,
            events,
            dispatcher,
            done_rx,
            wake_tx,
            wake_rx,
            shutdown,
            armed: HashMap::new(),
            graphs: HashMap::new(),
            canceled: HashSet::new(),
            settled: HashSet::new(),
        }
    }

    /// Main loop. Returns when shutdown is requested, or with an error when
    /// the coordination session is lost.
    pub async fn run(mut self) -> Result<()> {
        info!(instance = %self.store.instance_id(), "scheduler loop started");

        let result = self.run_loop().await;

        if let Err(ref e) = result {
            error!(instance = %self.store.instance_id(), error = %e, "scheduler loop failed");
        }
        self.wind_down(result.is_ok()).await;
        for (_, forward) in self.armed.drain() {
            forward.abort();
        }

        info!(instance = %self.store.instance_id(), "scheduler loop exiting");
        result
    }

    async fn run_loop(&mut self) -> Result<()> {
        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }

            if let Err(e) = self.tick().await {
                check_fatal(e)?;
            }

            tokio::select! {
                biased;

                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Ok(());
                    }
                }

                Some(done) = self.done_rx.recv() => {
                    self.on_finished(done).await?;
                    // Pick up whatever else finished meanwhile.
                    while let Ok(done) = self.done_rx.try_recv() {
                        self.on_finished(done).await?;
                    }
                }

                Some(event) = self.wake_rx.recv() => {
                    debug!(path = %event.path, kind = ?event.kind, "watch fired");
                    self.armed.remove(&(event.path, event.kind));
                    while let Ok(event) = self.wake_rx.try_recv() {
                        self.armed.remove(&(event.path, event.kind));
                    }
                }

                _ = sleep(self.options.poll_interval) => {}
            }
        }
    }

    /// Stop local executions. On a clean shutdown their outcomes are still
    /// recorded; after a lost session nothing can be written any more.
    async fn wind_down(&mut self, record_outcomes: bool) {
        if self.dispatcher.inflight() == 0 {
            return;
        }

        info!(
            inflight = self.dispatcher.inflight(),
            "cancelling local task executions"
        );
        self.dispatcher.cancel_all();

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while self.dispatcher.inflight() > 0 {
            match tokio::time::timeout_at(deadline, self.done_rx.recv()).await {
                Ok(Some(done)) => {
                    if record_outcomes {
                        if let Err(e) = self.on_finished(done).await {
                            warn!(error = %e, "failed to record task outcome during shutdown");
                        }
                    } else {
                        self.dispatcher.finished(&done.run_id, &done.task_id);
                    }
                }
                Ok(None) => break,
                Err(_elapsed) => {
                    warn!(
                        inflight = self.dispatcher.inflight(),
                        "task executions did not stop in time; aborting them"
                    );
                    break;
                }
            }
        }

        self.dispatcher.abort_all();
    }

    // ---------------------------------------------------------------------
    // One iteration
    // ---------------------------------------------------------------------

    async fn tick(&mut self) -> Result<()> {
        match self.definitions.load() {
            Ok(definitions) => {
                if !definitions.schedules.is_empty() {
                    self.evaluate_schedules(&definitions).await?;
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to load definitions; skipping schedule evaluation");
            }
        }

        self.progress_runs().await
    }

    async fn evaluate_schedules(&mut self, definitions: &Definitions) -> Result<()> {
        // Unlocked pre-check; the decision is repeated under the lock.
        if !self.any_due(definitions).await? {
            return Ok(());
        }

        let coord = Arc::clone(self.store.coordinator());
        let lock = DistributedLock::new(self.store.namespace().schedule_lock());

        let Some(guard) = lock.acquire(coord.as_ref(), self.options.lock_timeout).await? else {
            debug!("schedule lock busy; skipping schedule evaluation this cycle");
            return Ok(());
        };

        let result = self.evaluate_locked(definitions).await;

        if let Err(e) = guard.release(coord.as_ref()).await {
            warn!(error = %e, "failed to release schedule lock");
        }
        result
    }

    async fn any_due(&self, definitions: &Definitions) -> Result<bool> {
        let now = Utc::now();
        for schedule in definitions.schedules.values() {
            let occurrences = self.store.occurrences(&schedule.id).await?;
            if due_occurrence(schedule, &occurrences, now).is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn evaluate_locked(&mut self, definitions: &Definitions) -> Result<()> {
        for schedule in definitions.schedules.values() {
            if let Err(e) = self.evaluate_schedule(schedule, definitions).await {
                if is_fatal(&e) {
                    return Err(e);
                }
                // Definition errors stay scoped to their schedule.
                error!(schedule = %schedule.id, error = %e, "failed to evaluate schedule");
            }
        }
        Ok(())
    }

    async fn evaluate_schedule(
        &mut self,
        schedule: &ScheduleDefinition,
        definitions: &Definitions,
    ) -> Result<()> {
        let occurrences = self.store.occurrences(&schedule.id).await?;
        let Some(occurrence) = due_occurrence(schedule, &occurrences, Utc::now()) else {
            return Ok(());
        };

        let dag = definitions.dags.get(&schedule.dag).ok_or_else(|| {
            FlockError::InvalidDag(format!(
                "schedule '{}' references unknown dag '{}'",
                schedule.id, schedule.dag
            ))
        })?;
        let snapshot = DagSnapshot::resolve(dag, &definitions.tasks)?;

        match self
            .store
            .try_create_run(&schedule.id, occurrence, snapshot)
            .await?
        {
            CreateRunOutcome::Created(record) => {
                self.events.emit(WorkflowEvent::RunStarted {
                    run_id: record.run_id,
                    schedule_id: record.schedule_id,
                    occurrence: record.occurrence,
                });
            }
            CreateRunOutcome::AlreadyExists(run_id) => {
                debug!(run_id = %run_id, "occurrence already materialised");
            }
        }
        Ok(())
    }

    async fn progress_runs(&mut self) -> Result<()> {
        let ns = self.store.namespace().clone();
        self.arm(&ns.runs_parent(), WatchKind::ChildrenChanged).await?;

        let active: BTreeSet<RunId> = self.store.list_active_run_ids().await?.into_iter().collect();
        self.forget_missing(&active);

        // Runs with local executions first, then the rest in id order.
        let local = self.dispatcher.runs_with_inflight();
        let mut ordered: Vec<RunId> = local.iter().filter(|r| active.contains(*r)).cloned().collect();
        ordered.extend(
            active
                .iter()
                .filter(|r| !local.contains(*r) && !self.settled.contains(*r))
                .cloned(),
        );
        ordered.truncate(self.options.max_concurrent_runs);

        for run_id in ordered {
            if let Err(e) = self.progress_run(&run_id).await {
                if is_fatal(&e) {
                    return Err(e);
                }
                warn!(run_id = %run_id, error = %e, "failed to progress run");
            }
        }
        Ok(())
    }

    async fn progress_run(&mut self, run_id: &RunId) -> Result<()> {
        let ns = self.store.namespace().clone();
        self.arm(&ns.completed_tasks(run_id), WatchKind::ChildrenChanged)
            .await?;
        self.arm(&ns.started_tasks(run_id), WatchKind::ChildrenChanged)
            .await?;

        let Some(state) = self.store.read_run_state(run_id).await? else {
            self.forget(run_id);
            return Ok(());
        };
        if state.terminal.is_none() {
            self.arm(&ns.terminal(run_id), WatchKind::Created).await?;
        }

        let graph = match self.graphs.get(run_id) {
            Some(graph) => graph.clone(),
            None => match state.record.dag.graph() {
                Ok(graph) => {
                    self.graphs.insert(run_id.clone(), graph.clone());
                    graph
                }
                Err(e) => {
                    error!(run_id = %run_id, error = %e, "run carries an invalid DAG; ignoring it");
                    self.settled.insert(run_id.clone());
                    return Ok(());
                }
            },
        };

        match decide(&state, &graph, self.options.max_task_attempts) {
            RunDecision::Canceled(reason) => self.on_canceled(run_id, reason),
            RunDecision::Finished => self.settle_if_idle(run_id),
            RunDecision::Complete => {
                if self.store.mark_run_completed(run_id).await? {
                    self.events.emit(WorkflowEvent::RunCompleted {
                        run_id: run_id.clone(),
                    });
                }
                self.settle_if_idle(run_id);
            }
            RunDecision::Exhausted { task, attempts } => {
                warn!(run_id = %run_id, task = %task, attempts, "task exhausted its attempts; force-failing run");
                let reason = TerminalReason::TaskExhausted { task, attempts };
                self.store
                    .mark_run_force_failed(run_id, reason.clone())
                    .await?;
                self.on_canceled(run_id, Some(reason));
            }
            RunDecision::Advance(ready) => {
                self.claim_ready(&state, ready).await?;
            }
            RunDecision::Wait => {}
        }
        Ok(())
    }

    async fn claim_ready(&mut self, state: &RunState, ready: Vec<ReadyTask>) -> Result<()> {
        let run_id = state.run_id();

        for candidate in ready {
            if self.dispatcher.is_running(run_id, &candidate.task) {
                continue;
            }
            let Some(permit) = self.dispatcher.try_reserve() else {
                debug!(run_id = %run_id, "dispatch pool full; deferring remaining ready tasks");
                break;
            };
            let Some(definition) = state.record.dag.task(&candidate.task).cloned() else {
                continue;
            };

            match self
                .store
                .mark_task_started(run_id, &candidate.task, candidate.attempt)
                .await?
            {
                ClaimOutcome::Granted => {
                    self.events.emit(WorkflowEvent::TaskStarted {
                        run_id: run_id.clone(),
                        task_id: candidate.task.clone(),
                        attempt: candidate.attempt,
                    });
                    self.dispatcher.dispatch(
                        permit,
                        ExecutableTask {
                            run_id: run_id.clone(),
                            task_id: candidate.task,
                            attempt: candidate.attempt,
                            definition,
                        },
                    );
                }
                ClaimOutcome::AlreadyStarted | ClaimOutcome::AlreadyCompleted => {
                    debug!(run_id = %run_id, task = %candidate.task, "task claimed elsewhere");
                }
                ClaimOutcome::RunTerminal => {
                    debug!(run_id = %run_id, "run became terminal while claiming; stopping");
                    break;
                }
            }
        }
        Ok(())
    }

    fn on_canceled(&mut self, run_id: &RunId, reason: Option<TerminalReason>) {
        self.dispatcher.cancel_run(run_id);
        if self.canceled.insert(run_id.clone()) {
            info!(run_id = %run_id, "run canceled");
            self.events.emit(WorkflowEvent::RunCanceled {
                run_id: run_id.clone(),
                reason,
            });
        }
        self.settle_if_idle(run_id);
    }

    fn settle_if_idle(&mut self, run_id: &RunId) {
        if self.dispatcher.inflight_for(run_id) == 0 {
            self.settled.insert(run_id.clone());
        }
    }

    // ---------------------------------------------------------------------
    // Finished executions
    // ---------------------------------------------------------------------

    async fn on_finished(&mut self, done: TaskFinished) -> Result<()> {
        self.dispatcher.finished(&done.run_id, &done.task_id);

        let result = match done.outcome {
            TaskOutcome::Success(result) => {
                self.record_success(&done.run_id, &done.task_id, result)
                    .await
            }
            TaskOutcome::Failed(reason) => {
                self.record_failure(&done.run_id, &done.task_id, reason)
                    .await
            }
            TaskOutcome::Cancelled => {
                debug!(run_id = %done.run_id, task = %done.task_id, "task execution cancelled");
                self.store
                    .abandon_task(&done.run_id, &done.task_id)
                    .await
                    .map(|_| ())
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if is_fatal(&e) => Err(e),
            Err(e) => {
                warn!(run_id = %done.run_id, task = %done.task_id, error = %e, "failed to record task outcome");
                Ok(())
            }
        }
    }

    async fn record_success(
        &mut self,
        run_id: &RunId,
        task_id: &TaskId,
        result: TaskResult,
    ) -> Result<()> {
        match self.store.mark_task_completed(run_id, task_id, result).await {
            Ok(()) => {
                self.events.emit(WorkflowEvent::TaskCompleted {
                    run_id: run_id.clone(),
                    task_id: task_id.clone(),
                });
                Ok(())
            }
            Err(FlockError::ClaimLost { .. }) => {
                warn!(run_id = %run_id, task = %task_id, "claim lost before completion was recorded; discarding result");
                Ok(())
            }
            Err(e) => {
                // Release the claim so the task is retried rather than stuck.
                self.release_claim(run_id, task_id).await;
                Err(e)
            }
        }
    }

    async fn record_failure(&mut self, run_id: &RunId, task_id: &TaskId, reason: String) -> Result<()> {
        let recorded = self
            .store
            .record_task_failure(run_id, task_id, reason.clone())
            .await;
        let attempts = match recorded {
            Ok(attempts) => attempts,
            Err(e) => {
                self.release_claim(run_id, task_id).await;
                return Err(e);
            }
        };
        self.store.abandon_task(run_id, task_id).await?;

        warn!(run_id = %run_id, task = %task_id, attempts, reason = %reason, "task failed");
        self.events.emit(WorkflowEvent::TaskFailed {
            run_id: run_id.clone(),
            task_id: task_id.clone(),
            reason,
            attempts,
        });
        Ok(())
    }

    async fn release_claim(&self, run_id: &RunId, task_id: &TaskId) {
        if let Err(e) = self.store.abandon_task(run_id, task_id).await {
            warn!(run_id = %run_id, task = %task_id, error = %e, "failed to release task claim");
        }
    }

    // ---------------------------------------------------------------------
    // Watches and bookkeeping
    // ---------------------------------------------------------------------

    async fn arm(&mut self, path: &str, kind: WatchKind) -> Result<()> {
        let key = (path.to_string(), kind);
        if self.armed.contains_key(&key) {
            return Ok(());
        }

        let rx = self.store.coordinator().watch(path, kind).await?;
        let wake_tx = self.wake_tx.clone();
        let forward = tokio::spawn(async move {
            if let Ok(event) = rx.await {
                let _ = wake_tx.send(event);
            }
        });
        self.armed.insert(key, forward);
        Ok(())
    }

    fn forget_missing(&mut self, active: &BTreeSet<RunId>) {
        let gone: Vec<RunId> = self
            .graphs
            .keys()
            .chain(self.settled.iter())
            .chain(self.canceled.iter())
            .filter(|r| !active.contains(*r))
            .cloned()
            .collect();
        for run_id in gone {
            self.forget(&run_id);
        }
    }

    fn forget(&mut self, run_id: &RunId) {
        self.graphs.remove(run_id);
        self.settled.remove(run_id);
        self.canceled.remove(run_id);

        let ns = self.store.namespace();
        let paths = [
            ns.completed_tasks(run_id),
            ns.started_tasks(run_id),
            ns.terminal(run_id),
        ];
        // Dropping the receiver lets the coordinator discard the watch.
        self.armed.retain(|(path, _), forward| {
            let keep = !paths.contains(path);
            if !keep {
                forward.abort();
            }
            keep
        });
    }
}

/// Errors after which the worker cannot continue.
fn is_fatal(e: &FlockError) -> bool {
    matches!(e, FlockError::Coordination(CoordError::SessionExpired))
}

fn check_fatal(e: FlockError) -> Result<()> {
    if is_fatal(&e) {
        Err(e)
    } else {
        warn!(error = %e, "scheduler iteration failed; retrying next cycle");
        Ok(())
    }
}
