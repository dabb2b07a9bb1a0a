// src/state/store.rs

use std::collections::BTreeMap;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::coord::paths::parse_occurrence_name;
use crate::coord::{
    delete_recursive, with_retry, CoordError, CreateMode, CreateOutcome, Namespace, RetryPolicy,
    SharedCoordinator,
};
use crate::dag::DagSnapshot;
use crate::errors::{FlockError, Result};
use crate::state::records::{
    ArchivedRun, CompletedTask, OccurrenceRecord, RunRecord, RunState, StartedTask, TaskFailure,
    TaskResult, TerminalReason, TerminalRecord,
};
use crate::types::{RunId, RunStatus, ScheduleId, TaskId};

/// Result of racing for the creation of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateRunOutcome {
    Created(RunRecord),
    AlreadyExists(RunId),
}

/// Result of racing for a task claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This instance owns the task and must execute it.
    Granted,
    /// Another instance holds the claim.
    AlreadyStarted,
    /// The task completed before the claim landed; nothing to do.
    AlreadyCompleted,
    /// The run reached a terminal state before the claim landed.
    RunTerminal,
}

/// Reads and writes the persisted state of runs.
///
/// Every coordination call is retried on transient errors according to the
/// store's [`RetryPolicy`]. The instance id of the store is the session id of
/// its coordinator, so ephemeral claims and ownership checks agree.
#[derive(Debug, Clone)]
pub struct RunStateStore {
    coord: SharedCoordinator,
    ns: Namespace,
    retry: RetryPolicy,
}

impl RunStateStore {
    pub fn new(coord: SharedCoordinator, ns: Namespace, retry: RetryPolicy) -> Self {
        Self { coord, ns, retry }
    }

    pub fn coordinator(&self) -> &SharedCoordinator {
        &self.coord
    }

    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    pub fn instance_id(&self) -> &str {
        self.coord.session_id()
    }

    // ---------------------------------------------------------------------
    // Runs
    // ---------------------------------------------------------------------

    /// Create the run for `occurrence` of `schedule` unless some worker
    /// already did.
    ///
    /// The snapshot is validated first; an invalid one creates nothing. On
    /// both outcomes the occurrence record is ensured, so a winner that died
    /// between the two writes is repaired by the next contender.
    pub async fn try_create_run(
        &self,
        schedule: &ScheduleId,
        occurrence: u32,
        snapshot: DagSnapshot,
    ) -> Result<CreateRunOutcome> {
        snapshot.graph()?;

        let run_id = RunId::for_occurrence(schedule, occurrence);

        if self.exists(&self.ns.archived_run(&run_id)).await? {
            debug!(run_id = %run_id, "run already archived; not recreating");
            return Ok(CreateRunOutcome::AlreadyExists(run_id));
        }

        let record = RunRecord {
            run_id: run_id.clone(),
            schedule_id: schedule.clone(),
            occurrence,
            dag: snapshot,
            created_at: Utc::now(),
            created_by: self.instance_id().to_string(),
        };

        let outcome = self
            .create_json(&self.ns.run(&run_id), &record, CreateMode::Persistent)
            .await?;

        match outcome {
            CreateOutcome::Created => {
                self.ensure_occurrence(schedule, occurrence, &run_id, &record)
                    .await?;
                info!(run_id = %run_id, schedule = %schedule, occurrence, "run created");
                Ok(CreateRunOutcome::Created(record))
            }
            CreateOutcome::AlreadyExists => {
                let existing: Option<RunRecord> = self.read_json(&self.ns.run(&run_id)).await?;
                if let Some(existing) = existing {
                    self.ensure_occurrence(schedule, occurrence, &run_id, &existing)
                        .await?;
                }
                debug!(run_id = %run_id, "run already created by another instance");
                Ok(CreateRunOutcome::AlreadyExists(run_id))
            }
        }
    }

    async fn ensure_occurrence(
        &self,
        schedule: &ScheduleId,
        occurrence: u32,
        run_id: &RunId,
        record: &RunRecord,
    ) -> Result<()> {
        let occ = OccurrenceRecord {
            run_id: run_id.clone(),
            created_at: record.created_at,
        };
        self.create_json(
            &self.ns.occurrence(schedule, occurrence),
            &occ,
            CreateMode::Persistent,
        )
        .await?;
        Ok(())
    }

    /// Occurrences of `schedule` created so far, keyed by occurrence number.
    pub async fn occurrences(&self, schedule: &ScheduleId) -> Result<BTreeMap<u32, OccurrenceRecord>> {
        let parent = self.ns.schedule(schedule);
        let mut out = BTreeMap::new();

        for name in self.children(&parent).await? {
            let Some(occurrence) = parse_occurrence_name(&name) else {
                warn!(schedule = %schedule, node = %name, "ignoring malformed occurrence node");
                continue;
            };
            let record: Option<OccurrenceRecord> = self
                .read_json(&self.ns.occurrence(schedule, occurrence))
                .await?;
            if let Some(record) = record {
                out.insert(occurrence, record);
            }
        }

        Ok(out)
    }

    /// Ids of runs that have not been cleaned.
    pub async fn list_active_run_ids(&self) -> Result<Vec<RunId>> {
        Ok(self
            .children(&self.ns.runs_parent())
            .await?
            .into_iter()
            .map(RunId::from)
            .collect())
    }

    pub async fn run_exists(&self, run_id: &RunId) -> Result<bool> {
        self.exists(&self.ns.run(run_id)).await
    }

    /// Read every marker of a run.
    ///
    /// Returns `None` if the run does not exist, including when it is cleaned
    /// while being read, so callers never act on a partial view.
    pub async fn read_run_state(&self, run_id: &RunId) -> Result<Option<RunState>> {
        let Some(record) = self.read_json::<RunRecord>(&self.ns.run(run_id)).await? else {
            return Ok(None);
        };

        // Started before completed: a task seen as neither was not complete
        // when the completion markers were read.
        let mut started = BTreeMap::new();
        for name in self.children(&self.ns.started_tasks(run_id)).await? {
            let task = TaskId::from(name);
            if let Some(marker) = self
                .read_json::<StartedTask>(&self.ns.started_task(run_id, &task))
                .await?
            {
                started.insert(task, marker);
            }
        }

        let mut completed = BTreeMap::new();
        for name in self.children(&self.ns.completed_tasks(run_id)).await? {
            let task = TaskId::from(name);
            let path = self.ns.completed_task(run_id, &task);
            if let Some(mut marker) = self.read_json::<CompletedTask>(&path).await? {
                marker.created_seq = self.created_seq(&path).await?;
                completed.insert(task, marker);
            }
        }

        let mut failures = BTreeMap::new();
        for name in self.children(&self.ns.failed_tasks(run_id)).await? {
            let task = TaskId::from(name);
            let task_path = self.ns.failed_task(run_id, &task);
            let mut attempts = Vec::new();
            for attempt in self.children(&task_path).await? {
                let path = format!("{task_path}/{attempt}");
                if let Some(failure) = self.read_json::<TaskFailure>(&path).await? {
                    attempts.push(failure);
                }
            }
            if !attempts.is_empty() {
                failures.insert(task, attempts);
            }
        }

        let terminal_path = self.ns.terminal(run_id);
        let mut terminal = self.read_json::<TerminalRecord>(&terminal_path).await?;
        if let Some(record) = terminal.as_mut() {
            record.created_seq = self.created_seq(&terminal_path).await?;
        }

        if !self.run_exists(run_id).await? {
            debug!(run_id = %run_id, "run disappeared while reading its state");
            return Ok(None);
        }

        Ok(Some(RunState {
            record,
            started,
            completed,
            failures,
            terminal,
        }))
    }

    // ---------------------------------------------------------------------
    // Tasks
    // ---------------------------------------------------------------------

    /// Claim `task` for this instance with an ephemeral started marker.
    pub async fn mark_task_started(
        &self,
        run_id: &RunId,
        task: &TaskId,
        attempt: u32,
    ) -> Result<ClaimOutcome> {
        let path = self.ns.started_task(run_id, task);
        let marker = StartedTask {
            instance: self.instance_id().to_string(),
            started_at: Utc::now(),
            attempt,
        };

        match self.create_json(&path, &marker, CreateMode::Ephemeral).await? {
            CreateOutcome::Created => {}
            CreateOutcome::AlreadyExists => {
                // A retried create may have landed on the first try.
                let current: Option<StartedTask> = self.read_json(&path).await?;
                match current {
                    Some(current) if current.instance == self.instance_id() => {}
                    _ => return Ok(ClaimOutcome::AlreadyStarted),
                }
            }
        }

        // The previous owner may have completed the task and gone away after
        // our read of the run; never execute a completed task twice.
        if self.exists(&self.ns.completed_task(run_id, task)).await? {
            self.delete_if_present(&path).await?;
            return Ok(ClaimOutcome::AlreadyCompleted);
        }

        // A stop may have landed after our read of the run. Claims created
        // after the terminal record never execute.
        if self.exists(&self.ns.terminal(run_id)).await? {
            self.delete_if_present(&path).await?;
            debug!(run_id = %run_id, task = %task, "run terminal before claim; releasing it");
            return Ok(ClaimOutcome::RunTerminal);
        }

        debug!(run_id = %run_id, task = %task, attempt, "task claimed");
        Ok(ClaimOutcome::Granted)
    }

    /// Record the successful completion of a task claimed by this instance.
    ///
    /// Completing an already-completed task is a no-op. Fails with
    /// [`FlockError::ClaimLost`] if this instance does not hold the claim.
    pub async fn mark_task_completed(
        &self,
        run_id: &RunId,
        task: &TaskId,
        result: TaskResult,
    ) -> Result<()> {
        let completed_path = self.ns.completed_task(run_id, task);
        if self.exists(&completed_path).await? {
            debug!(run_id = %run_id, task = %task, "task already completed");
            return Ok(());
        }

        self.ensure_owned(run_id, task).await?;

        let marker = CompletedTask {
            instance: self.instance_id().to_string(),
            completed_at: Utc::now(),
            result,
            created_seq: None,
        };
        self.create_json(&completed_path, &marker, CreateMode::Persistent)
            .await?;
        debug!(run_id = %run_id, task = %task, "task completed");
        Ok(())
    }

    /// Record a failed execution attempt. Returns the number of failed
    /// attempts of the task so far.
    pub async fn record_task_failure(
        &self,
        run_id: &RunId,
        task: &TaskId,
        reason: impl Into<String>,
    ) -> Result<u32> {
        let failure = TaskFailure {
            instance: self.instance_id().to_string(),
            failed_at: Utc::now(),
            reason: reason.into(),
        };
        let data = serde_json::to_vec(&failure)?;
        let prefix = self.ns.failed_attempt_prefix(run_id, task);

        with_retry(&self.retry, "record task failure", || {
            self.coord
                .create_sequential(&prefix, &data, CreateMode::Persistent)
        })
        .await?;

        let attempts = self.children(&self.ns.failed_task(run_id, task)).await?.len() as u32;
        debug!(run_id = %run_id, task = %task, attempts, "task failure recorded");
        Ok(attempts)
    }

    /// Release this instance's claim on a task so any worker may retry it.
    ///
    /// Returns `false` if the claim was not held by this instance.
    pub async fn abandon_task(&self, run_id: &RunId, task: &TaskId) -> Result<bool> {
        let path = self.ns.started_task(run_id, task);
        let current: Option<StartedTask> = self.read_json(&path).await?;
        match current {
            Some(marker) if marker.instance == self.instance_id() => {
                self.delete_if_present(&path).await
            }
            _ => Ok(false),
        }
    }

    async fn ensure_owned(&self, run_id: &RunId, task: &TaskId) -> Result<()> {
        let current: Option<StartedTask> =
            self.read_json(&self.ns.started_task(run_id, task)).await?;
        match current {
            Some(marker) if marker.instance == self.instance_id() => Ok(()),
            _ => Err(FlockError::ClaimLost {
                run_id: run_id.clone(),
                task: task.clone(),
            }),
        }
    }

    // ---------------------------------------------------------------------
    // Terminal states
    // ---------------------------------------------------------------------

    /// Force-fail a run. Returns `true` only for the caller that created the
    /// terminal record.
    pub async fn mark_run_force_failed(&self, run_id: &RunId, reason: TerminalReason) -> Result<bool> {
        self.mark_terminal(run_id, RunStatus::ForceFailed, Some(reason))
            .await
    }

    /// Mark a run completed. Returns `true` only for the caller that created
    /// the terminal record.
    pub async fn mark_run_completed(&self, run_id: &RunId) -> Result<bool> {
        self.mark_terminal(run_id, RunStatus::Completed, None).await
    }

    async fn mark_terminal(
        &self,
        run_id: &RunId,
        status: RunStatus,
        reason: Option<TerminalReason>,
    ) -> Result<bool> {
        let record = TerminalRecord {
            status,
            reason,
            at: Utc::now(),
            instance: self.instance_id().to_string(),
            created_seq: None,
        };
        let outcome = self
            .create_json(&self.ns.terminal(run_id), &record, CreateMode::Persistent)
            .await?;
        if outcome.is_created() {
            info!(run_id = %run_id, status = %status, "run reached terminal state");
        }
        Ok(outcome.is_created())
    }

    // ---------------------------------------------------------------------
    // Archive
    // ---------------------------------------------------------------------

    /// Write the archive bundle of a run. Returns `false` if an archive for
    /// the run already exists.
    pub async fn archive_run(&self, state: &RunState) -> Result<bool> {
        let bundle = ArchivedRun {
            state: state.clone(),
            archived_at: Utc::now(),
            archived_by: self.instance_id().to_string(),
        };
        let outcome = self
            .create_json(
                &self.ns.archived_run(state.run_id()),
                &bundle,
                CreateMode::Persistent,
            )
            .await?;
        Ok(outcome.is_created())
    }

    pub async fn read_archived_run(&self, run_id: &RunId) -> Result<Option<ArchivedRun>> {
        self.read_json(&self.ns.archived_run(run_id)).await
    }

    pub async fn is_archived(&self, run_id: &RunId) -> Result<bool> {
        self.exists(&self.ns.archived_run(run_id)).await
    }

    /// Remove the active state of a run.
    ///
    /// The run node goes first so that readers stop seeing the run before
    /// any of its markers disappear.
    pub async fn delete_active_run(&self, run_id: &RunId) -> Result<()> {
        self.delete_if_present(&self.ns.run(run_id)).await?;

        for path in [
            self.ns.started_tasks(run_id),
            self.ns.completed_tasks(run_id),
            self.ns.failed_tasks(run_id),
            self.ns.terminal(run_id),
        ] {
            with_retry(&self.retry, "delete run markers", || {
                delete_recursive(self.coord.as_ref(), &path)
            })
            .await?;
        }

        info!(run_id = %run_id, "active run state deleted");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(with_retry(&self.retry, "exists", || self.coord.exists(path)).await?)
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        Ok(with_retry(&self.retry, "get children", || self.coord.get_children(path)).await?)
    }

    async fn created_seq(&self, path: &str) -> Result<Option<u64>> {
        let stat = with_retry(&self.retry, "stat", || self.coord.stat(path)).await?;
        Ok(stat.map(|s| s.created_seq))
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let data = with_retry(&self.retry, "get data", || self.coord.get_data(path)).await?;
        match data {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn create_json<T: Serialize>(
        &self,
        path: &str,
        value: &T,
        mode: CreateMode,
    ) -> Result<CreateOutcome> {
        let data = serde_json::to_vec(value)?;
        Ok(with_retry(&self.retry, "create", || self.coord.create(path, &data, mode)).await?)
    }

    async fn delete_if_present(&self, path: &str) -> Result<bool> {
        let result = with_retry(&self.retry, "delete", || self.coord.delete(path)).await;
        match result {
            Ok(()) => Ok(true),
            Err(CoordError::NoNode(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
