// src/definitions.rs

//! Static workflow definitions: schedules, task DAGs and tasks.
//!
//! Definitions are immutable and read-only from the scheduler's point of view.
//! They are obtained through a [`DefinitionSource`], which may return the same
//! snapshot forever ([`StaticDefinitions`]) or re-read storage on every poll
//! cycle (see `config::source::FileDefinitions`).

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::types::{DagId, ScheduleId, TaskId};

/// A unit of work as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: TaskId,
    /// Shell command, used by the shell executor. Other executors may ignore it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    /// Opaque metadata handed to the execution callback.
    #[serde(default)]
    pub payload: BTreeMap<String, String>,
}

impl TaskDefinition {
    pub fn new(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            cmd: None,
            payload: BTreeMap::new(),
        }
    }
}

/// Task nodes plus the dependency relation (task -> prerequisite tasks).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDagDefinition {
    pub id: DagId,
    pub tasks: BTreeMap<TaskId, Vec<TaskId>>,
}

impl TaskDagDefinition {
    pub fn new(id: impl Into<DagId>) -> Self {
        Self {
            id: id.into(),
            tasks: BTreeMap::new(),
        }
    }

    /// Builder-style helper: add `task` depending on `after`.
    pub fn with_task<I, T>(mut self, task: impl Into<TaskId>, after: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.tasks
            .insert(task.into(), after.into_iter().map(Into::into).collect());
        self
    }
}

/// How many occurrences a schedule produces and how far apart they are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repetition {
    /// Number of occurrences; `None` repeats forever.
    pub count: Option<u32>,
    /// Minimum time between the creation of consecutive occurrences.
    pub interval: Duration,
}

impl Default for Repetition {
    fn default() -> Self {
        Self::once()
    }
}

impl Repetition {
    pub fn once() -> Self {
        Self {
            count: Some(1),
            interval: Duration::ZERO,
        }
    }

    pub fn times(count: u32, interval: Duration) -> Self {
        Self {
            count: Some(count),
            interval,
        }
    }

    pub fn forever(interval: Duration) -> Self {
        Self {
            count: None,
            interval,
        }
    }

    /// Whether every occurrence has been created.
    pub fn is_exhausted(&self, created: u32) -> bool {
        matches!(self.count, Some(count) if created >= count)
    }

    /// The occurrence that is due at `now`, if any.
    ///
    /// `created` is the number of occurrences already created and
    /// `last_created_at` the creation time of the latest one. Completion of an
    /// earlier occurrence never gates a later one; only the interval does.
    pub fn next_due(
        &self,
        created: u32,
        last_created_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<u32> {
        if self.is_exhausted(created) {
            return None;
        }

        match last_created_at {
            None => Some(created),
            Some(last) => {
                let interval = chrono::Duration::from_std(self.interval)
                    .unwrap_or(chrono::Duration::MAX);
                let due_at = last.checked_add_signed(interval)?;
                (now >= due_at).then_some(created)
            }
        }
    }
}

/// A recurring (or one-shot) request to run a DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub id: ScheduleId,
    pub dag: DagId,
    pub repetition: Repetition,
}

impl ScheduleDefinition {
    pub fn new(id: impl Into<ScheduleId>, dag: impl Into<DagId>, repetition: Repetition) -> Self {
        Self {
            id: id.into(),
            dag: dag.into(),
            repetition,
        }
    }
}

/// Everything currently configured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Definitions {
    pub schedules: BTreeMap<ScheduleId, ScheduleDefinition>,
    pub dags: BTreeMap<DagId, TaskDagDefinition>,
    pub tasks: BTreeMap<TaskId, TaskDefinition>,
}

impl Definitions {
    pub fn with_task(mut self, task: TaskDefinition) -> Self {
        self.tasks.insert(task.id.clone(), task);
        self
    }

    pub fn with_dag(mut self, dag: TaskDagDefinition) -> Self {
        self.dags.insert(dag.id.clone(), dag);
        self
    }

    pub fn with_schedule(mut self, schedule: ScheduleDefinition) -> Self {
        self.schedules.insert(schedule.id.clone(), schedule);
        self
    }
}

/// Read-only accessor for the configured definitions.
pub trait DefinitionSource: Send + Sync + fmt::Debug {
    /// Return the full current set of definitions.
    fn load(&self) -> Result<Definitions>;
}

/// A definition source that never changes.
#[derive(Debug, Clone)]
pub struct StaticDefinitions {
    definitions: Definitions,
}

impl StaticDefinitions {
    pub fn new(definitions: Definitions) -> Self {
        Self { definitions }
    }
}

impl DefinitionSource for StaticDefinitions {
    fn load(&self) -> Result<Definitions> {
        Ok(self.definitions.clone())
    }
}
