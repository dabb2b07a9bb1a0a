// src/state/records.rs

//! Serialized node payloads and the aggregated view of one run.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::DagSnapshot;
use crate::types::{RunId, RunStatus, ScheduleId, TaskId};

/// Payload of `runs/<run>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub schedule_id: ScheduleId,
    pub occurrence: u32,
    pub dag: DagSnapshot,
    pub created_at: DateTime<Utc>,
    /// Instance that won the creation race.
    pub created_by: String,
}

/// Payload of `schedules/<schedule>/<occurrence>`.
///
/// Outlives the run it points at, so cleaning a run never re-triggers its
/// occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccurrenceRecord {
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
}

/// Payload of the ephemeral claim marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedTask {
    pub instance: String,
    pub started_at: DateTime<Utc>,
    /// 1-based attempt number at claim time.
    pub attempt: u32,
}

/// What a successful execution hands back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl TaskResult {
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: BTreeMap::new(),
        }
    }
}

/// Payload of the persistent completion marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedTask {
    pub instance: String,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub result: TaskResult,
    /// Creation order of the marker; filled in when read back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_seq: Option<u64>,
}

/// One failed execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub instance: String,
    pub failed_at: DateTime<Utc>,
    pub reason: String,
}

/// Why a run was forced into a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminalReason {
    /// Stopped by an operator.
    Operator,
    /// A task failed more often than allowed.
    TaskExhausted { task: TaskId, attempts: u32 },
}

impl std::fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalReason::Operator => f.write_str("stopped by operator"),
            TerminalReason::TaskExhausted { task, attempts } => {
                write!(f, "task '{task}' failed {attempts} times")
            }
        }
    }
}

/// Payload of `terminal/<run>`. Created at most once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalRecord {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<TerminalReason>,
    pub at: DateTime<Utc>,
    pub instance: String,
    /// Creation order of the record; filled in when read back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_seq: Option<u64>,
}

/// Everything persisted about one run, read in one pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub record: RunRecord,
    #[serde(default)]
    pub started: BTreeMap<TaskId, StartedTask>,
    #[serde(default)]
    pub completed: BTreeMap<TaskId, CompletedTask>,
    #[serde(default)]
    pub failures: BTreeMap<TaskId, Vec<TaskFailure>>,
    #[serde(default)]
    pub terminal: Option<TerminalRecord>,
}

impl RunState {
    pub fn run_id(&self) -> &RunId {
        &self.record.run_id
    }

    pub fn completed_ids(&self) -> BTreeSet<TaskId> {
        self.completed.keys().cloned().collect()
    }

    pub fn started_ids(&self) -> BTreeSet<TaskId> {
        self.started.keys().cloned().collect()
    }

    /// Started tasks that have not completed. Completion wins.
    pub fn running_tasks(&self) -> BTreeMap<&TaskId, &StartedTask> {
        self.started
            .iter()
            .filter(|(task, _)| !self.completed.contains_key(*task))
            .collect()
    }

    pub fn failed_attempts(&self, task: &TaskId) -> u32 {
        self.failures
            .get(task)
            .map(|f| f.len() as u32)
            .unwrap_or(0)
    }

    /// Whether every task of the run's DAG has a completion marker.
    pub fn all_completed(&self) -> bool {
        self.record
            .dag
            .task_ids()
            .all(|task| self.completed.contains_key(task))
    }

    /// The terminal record that decides the run's status.
    ///
    /// A force-fail created after every completion marker of the run lost
    /// the race against the last completion and is ignored. Creation order
    /// comes from the namespace, so every reader agrees on it.
    pub fn effective_terminal(&self) -> Option<&TerminalRecord> {
        self.terminal.as_ref().filter(|terminal| {
            terminal.status != RunStatus::ForceFailed || !self.all_completed_before(terminal)
        })
    }

    fn all_completed_before(&self, terminal: &TerminalRecord) -> bool {
        let Some(terminal_seq) = terminal.created_seq else {
            return false;
        };
        self.record.dag.task_ids().all(|task| {
            self.completed
                .get(task)
                .and_then(|marker| marker.created_seq)
                .is_some_and(|seq| seq < terminal_seq)
        })
    }

    /// The effective terminal record wins, then "every task completed", then
    /// running.
    pub fn status(&self) -> RunStatus {
        match self.effective_terminal() {
            Some(terminal) => terminal.status,
            None if self.all_completed() => RunStatus::Completed,
            None => RunStatus::Running,
        }
    }
}

/// Payload of `archive/<run>`: the final state of a cleaned run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedRun {
    pub state: RunState,
    pub archived_at: DateTime<Utc>,
    pub archived_by: String,
}
