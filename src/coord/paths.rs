// src/coord/paths.rs

//! Namespace layout of persisted workflow state.
//!
//! ```text
//! <root>/runs/<run>                               run record (persistent)
//! <root>/started-tasks/<run>/<task>               claim marker (ephemeral)
//! <root>/completed-tasks/<run>/<task>             completion marker (persistent)
//! <root>/failed-tasks/<run>/<task>/attempt-<seq>  failed attempt (persistent)
//! <root>/terminal/<run>                           terminal record (persistent)
//! <root>/schedules/<schedule>/<occurrence>        occurrence record (persistent)
//! <root>/archive/<run>                            archived run bundle
//! <root>/locks/schedules/lock-<seq>               schedule evaluation mutex
//! ```
//!
//! Markers live in per-kind trees rather than under the run node, so the run
//! node can be deleted first when a run is cleaned.

use crate::coord::join_path;
use crate::types::{RunId, ScheduleId, TaskId};

pub const DEFAULT_NAMESPACE: &str = "/flockdag";

const RUNS: &str = "runs";
const STARTED_TASKS: &str = "started-tasks";
const COMPLETED_TASKS: &str = "completed-tasks";
const FAILED_TASKS: &str = "failed-tasks";
const TERMINAL: &str = "terminal";
const SCHEDULES: &str = "schedules";
const ARCHIVE: &str = "archive";
const LOCKS: &str = "locks";

/// Path builder rooted at a configurable namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    root: String,
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl Namespace {
    pub fn new(root: impl Into<String>) -> Self {
        let mut root = root.into();
        while root.len() > 1 && root.ends_with('/') {
            root.pop();
        }
        Self { root }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    fn section(&self, name: &str) -> String {
        join_path(&self.root, name)
    }

    pub fn runs_parent(&self) -> String {
        self.section(RUNS)
    }

    pub fn run(&self, run_id: &RunId) -> String {
        join_path(&self.runs_parent(), run_id.as_str())
    }

    pub fn started_tasks_parent(&self) -> String {
        self.section(STARTED_TASKS)
    }

    pub fn started_tasks(&self, run_id: &RunId) -> String {
        join_path(&self.started_tasks_parent(), run_id.as_str())
    }

    pub fn started_task(&self, run_id: &RunId, task: &TaskId) -> String {
        join_path(&self.started_tasks(run_id), task.as_str())
    }

    pub fn completed_tasks_parent(&self) -> String {
        self.section(COMPLETED_TASKS)
    }

    pub fn completed_tasks(&self, run_id: &RunId) -> String {
        join_path(&self.completed_tasks_parent(), run_id.as_str())
    }

    pub fn completed_task(&self, run_id: &RunId, task: &TaskId) -> String {
        join_path(&self.completed_tasks(run_id), task.as_str())
    }

    pub fn failed_tasks_parent(&self) -> String {
        self.section(FAILED_TASKS)
    }

    pub fn failed_tasks(&self, run_id: &RunId) -> String {
        join_path(&self.failed_tasks_parent(), run_id.as_str())
    }

    pub fn failed_task(&self, run_id: &RunId, task: &TaskId) -> String {
        join_path(&self.failed_tasks(run_id), task.as_str())
    }

    /// Prefix for sequential failed-attempt nodes of a task.
    pub fn failed_attempt_prefix(&self, run_id: &RunId, task: &TaskId) -> String {
        join_path(&self.failed_task(run_id, task), "attempt-")
    }

    pub fn terminal_parent(&self) -> String {
        self.section(TERMINAL)
    }

    pub fn terminal(&self, run_id: &RunId) -> String {
        join_path(&self.terminal_parent(), run_id.as_str())
    }

    pub fn schedules_parent(&self) -> String {
        self.section(SCHEDULES)
    }

    pub fn schedule(&self, schedule: &ScheduleId) -> String {
        join_path(&self.schedules_parent(), schedule.as_str())
    }

    pub fn occurrence(&self, schedule: &ScheduleId, occurrence: u32) -> String {
        join_path(&self.schedule(schedule), &occurrence_name(occurrence))
    }

    pub fn archive_parent(&self) -> String {
        self.section(ARCHIVE)
    }

    pub fn archived_run(&self, run_id: &RunId) -> String {
        join_path(&self.archive_parent(), run_id.as_str())
    }

    pub fn schedule_lock(&self) -> String {
        join_path(&self.section(LOCKS), SCHEDULES)
    }
}

/// Occurrence node names sort lexically in occurrence order.
pub fn occurrence_name(occurrence: u32) -> String {
    format!("{occurrence:010}")
}

pub fn parse_occurrence_name(name: &str) -> Option<u32> {
    name.parse().ok()
}
