// src/engine/core.rs

//! Pure scheduling decisions.
//!
//! Nothing here touches the namespace, channels or the clock: callers read
//! the persisted state, ask for a decision and carry it out. This keeps the
//! rules that every worker must agree on deterministic and easy to test.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::dag::{is_complete, ready_set, DagGraph};
use crate::definitions::ScheduleDefinition;
use crate::state::{OccurrenceRecord, RunState, TerminalReason};
use crate::types::{RunStatus, TaskId};

/// Scheduler view of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunPhase {
    /// No task has completed yet.
    Pending,
    Running,
    Completed,
    ForceFailed,
}

impl RunPhase {
    pub fn of(state: &RunState) -> Self {
        match state.status() {
            RunStatus::Completed => RunPhase::Completed,
            RunStatus::ForceFailed => RunPhase::ForceFailed,
            RunStatus::Running if state.completed.is_empty() => RunPhase::Pending,
            RunStatus::Running => RunPhase::Running,
        }
    }

    /// Externally visible status. `Pending` reports as running.
    pub fn status(self) -> RunStatus {
        match self {
            RunPhase::Pending | RunPhase::Running => RunStatus::Running,
            RunPhase::Completed => RunStatus::Completed,
            RunPhase::ForceFailed => RunStatus::ForceFailed,
        }
    }
}

/// A task that may be claimed, with the attempt number the claim will carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyTask {
    pub task: TaskId,
    pub attempt: u32,
}

/// What a worker should do with a run right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunDecision {
    /// The run was force-failed; stop local executions.
    Canceled(Option<TerminalReason>),
    /// The run's completion is already recorded.
    Finished,
    /// Every task completed but nobody recorded it yet.
    Complete,
    /// A ready task used up its attempts; the run must be force-failed.
    Exhausted { task: TaskId, attempts: u32 },
    /// Claim these tasks.
    Advance(Vec<ReadyTask>),
    /// Tasks are running elsewhere; nothing to claim.
    Wait,
}

/// Decide the next step for a run.
///
/// `max_task_attempts == 0` never exhausts.
pub fn decide(state: &RunState, graph: &DagGraph, max_task_attempts: u32) -> RunDecision {
    if let Some(terminal) = state.effective_terminal() {
        return match terminal.status {
            RunStatus::ForceFailed => RunDecision::Canceled(terminal.reason.clone()),
            RunStatus::Completed | RunStatus::Running => RunDecision::Finished,
        };
    }

    let completed = state.completed_ids();
    if is_complete(graph, &completed) {
        return RunDecision::Complete;
    }

    let ready = ready_set(graph, &completed, &state.started_ids());
    let mut claimable = Vec::with_capacity(ready.len());

    for task in ready {
        let failed = state.failed_attempts(&task);
        if max_task_attempts > 0 && failed >= max_task_attempts {
            return RunDecision::Exhausted {
                task,
                attempts: failed,
            };
        }
        claimable.push(ReadyTask {
            task,
            attempt: failed + 1,
        });
    }

    if claimable.is_empty() {
        RunDecision::Wait
    } else {
        RunDecision::Advance(claimable)
    }
}

/// The next occurrence of `schedule` that should be created at `now`.
///
/// Occurrences are created in order; the next one is due once the interval
/// since the creation of the latest one has elapsed. Completion of earlier
/// runs does not gate later ones.
pub fn due_occurrence(
    schedule: &ScheduleDefinition,
    occurrences: &BTreeMap<u32, OccurrenceRecord>,
    now: DateTime<Utc>,
) -> Option<u32> {
    let (next, last_created_at) = match occurrences.last_key_value() {
        Some((occurrence, record)) => (occurrence.saturating_add(1), Some(record.created_at)),
        None => (0, None),
    };
    schedule.repetition.next_due(next, last_created_at, now)
}
