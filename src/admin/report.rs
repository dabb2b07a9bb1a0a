// src/admin/report.rs

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::state::{CompletedTask, RunState, RunStateStore, StartedTask, TerminalReason};
use crate::types::{RunId, RunStatus, ScheduleId, TaskId};

/// Point-in-time view of one run.
///
/// A report for an unknown run, or for one that has been cleaned, is
/// *invalid*: it carries the id and nothing else. Archived runs are read
/// with [`RunReport::load_archived`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: RunId,
    valid: bool,
    archived: bool,
    pub schedule_id: Option<ScheduleId>,
    pub created_at: Option<DateTime<Utc>>,
    status: Option<RunStatus>,
    pub completed: BTreeMap<TaskId, CompletedTask>,
    /// Started and not completed; completion wins over a lingering claim.
    pub running: BTreeMap<TaskId, StartedTask>,
    pub failed_attempts: BTreeMap<TaskId, u32>,
    pub terminal_reason: Option<TerminalReason>,
}

impl RunReport {
    /// Read the active state of a run.
    pub async fn load(store: &RunStateStore, run_id: &RunId) -> Result<Self> {
        Ok(match store.read_run_state(run_id).await? {
            Some(state) => Self::from_state(&state, false),
            None => Self::invalid(run_id.clone()),
        })
    }

    /// Read a cleaned run from the archive.
    pub async fn load_archived(store: &RunStateStore, run_id: &RunId) -> Result<Option<Self>> {
        Ok(store
            .read_archived_run(run_id)
            .await?
            .map(|archived| Self::from_state(&archived.state, true)))
    }

    pub fn from_state(state: &RunState, archived: bool) -> Self {
        let running = state
            .running_tasks()
            .into_iter()
            .map(|(task, marker)| (task.clone(), marker.clone()))
            .collect();
        let failed_attempts = state
            .failures
            .iter()
            .map(|(task, failures)| (task.clone(), failures.len() as u32))
            .collect();

        Self {
            run_id: state.run_id().clone(),
            valid: true,
            archived,
            schedule_id: Some(state.record.schedule_id.clone()),
            created_at: Some(state.record.created_at),
            status: Some(state.status()),
            completed: state.completed.clone(),
            running,
            failed_attempts,
            terminal_reason: state.effective_terminal().and_then(|t| t.reason.clone()),
        }
    }

    fn invalid(run_id: RunId) -> Self {
        Self {
            run_id,
            valid: false,
            archived: false,
            schedule_id: None,
            created_at: None,
            status: None,
            completed: BTreeMap::new(),
            running: BTreeMap::new(),
            failed_attempts: BTreeMap::new(),
            terminal_reason: None,
        }
    }

    /// Whether any state exists for the run.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_archived(&self) -> bool {
        self.archived
    }

    /// `None` for an invalid report.
    pub fn status(&self) -> Option<RunStatus> {
        self.status
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(status) = self.status else {
            return write!(f, "{}: unknown run", self.run_id);
        };

        write!(
            f,
            "{}: {} (completed {}, running {})",
            self.run_id,
            status,
            self.completed.len(),
            self.running.len()
        )?;
        if let Some(reason) = &self.terminal_reason {
            write!(f, " - {reason}")?;
        }
        let failed: u32 = self.failed_attempts.values().sum();
        if failed > 0 {
            write!(f, " [{failed} failed attempts]")?;
        }
        Ok(())
    }
}

/// Reports of every active run, in run id order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllRunReports {
    reports: Vec<RunReport>,
}

impl AllRunReports {
    pub async fn load(store: &RunStateStore) -> Result<Self> {
        let mut reports = Vec::new();
        for run_id in store.list_active_run_ids().await? {
            let report = RunReport::load(store, &run_id).await?;
            // Cleaned between listing and reading.
            if report.is_valid() {
                reports.push(report);
            }
        }
        Ok(Self { reports })
    }

    pub fn reports(&self) -> &[RunReport] {
        &self.reports
    }

    pub fn get(&self, run_id: &RunId) -> Option<&RunReport> {
        self.reports.iter().find(|r| &r.run_id == run_id)
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    /// Whether every listed run is terminal.
    pub fn all_terminal(&self) -> bool {
        self.reports
            .iter()
            .all(|r| r.status().is_some_and(RunStatus::is_terminal))
    }
}
