// src/config/model.rs

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::coord::paths::DEFAULT_NAMESPACE;
use crate::definitions::{
    Definitions, Repetition, ScheduleDefinition, TaskDagDefinition, TaskDefinition,
};

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [config]
/// poll_interval_ms = 1000
/// dispatch_pool_size = 10
///
/// [task.compile]
/// cmd = "make"
///
/// [task.test]
/// cmd = "make test"
///
/// [dag.build.task.compile]
///
/// [dag.build.task.test]
/// after = ["compile"]
///
/// [schedule.nightly]
/// dag = "build"
/// repeat = 2
/// interval_ms = 60000
/// ```
///
/// All sections are optional and have reasonable defaults. This is the
/// unvalidated form; see [`ConfigFile`].
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfigFile {
    /// Scheduler tunables from `[config]`.
    #[serde(default)]
    pub config: ConfigSection,

    /// Task definitions from `[task.<id>]`.
    #[serde(default)]
    pub task: BTreeMap<String, TaskConfig>,

    /// DAG definitions from `[dag.<id>]`.
    #[serde(default)]
    pub dag: BTreeMap<String, DagConfig>,

    /// Schedules from `[schedule.<id>]`.
    #[serde(default)]
    pub schedule: BTreeMap<String, ScheduleConfig>,
}

/// Validated configuration.
///
/// Only obtainable through `TryFrom<RawConfigFile>` (or the loader), which
/// guarantees that every reference resolves and every DAG is acyclic.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub config: ConfigSection,
    pub task: BTreeMap<String, TaskConfig>,
    pub dag: BTreeMap<String, DagConfig>,
    pub schedule: BTreeMap<String, ScheduleConfig>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile) -> Self {
        Self {
            config: raw.config,
            task: raw.task,
            dag: raw.dag,
            schedule: raw.schedule,
        }
    }

    /// Convert the configured sections into workflow definitions.
    pub fn definitions(&self) -> Definitions {
        let tasks = self
            .task
            .iter()
            .map(|(id, tc)| {
                let def = TaskDefinition {
                    id: id.as_str().into(),
                    cmd: tc.cmd.clone(),
                    payload: tc.payload.clone(),
                };
                (def.id.clone(), def)
            })
            .collect();

        let dags = self
            .dag
            .iter()
            .map(|(id, dc)| {
                let mut dag = TaskDagDefinition::new(id.as_str());
                for (task, node) in dc.task.iter() {
                    dag = dag.with_task(task.as_str(), node.after.iter().map(String::as_str));
                }
                (dag.id.clone(), dag)
            })
            .collect();

        let schedules = self
            .schedule
            .iter()
            .map(|(id, sc)| {
                let def = ScheduleDefinition::new(id.as_str(), sc.dag.as_str(), sc.repetition());
                (def.id.clone(), def)
            })
            .collect();

        Definitions {
            schedules,
            dags,
            tasks,
        }
    }
}

/// `[config]` section: numeric tunables of a worker.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigSection {
    /// Cadence of schedule and run re-evaluation when no watch fires.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum wait for the schedule-evaluation mutex before the attempt is
    /// abandoned until the next cycle.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Number of task executions a worker runs concurrently.
    #[serde(default = "default_dispatch_pool_size")]
    pub dispatch_pool_size: usize,

    /// Number of runs a worker drives at the same time.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// Failed executions of one task tolerated before its run is
    /// force-failed. `0` retries forever.
    #[serde(default = "default_max_task_attempts")]
    pub max_task_attempts: u32,

    /// Root of the coordination namespace.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Attempts (including the first) for coordination calls that fail
    /// transiently.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Initial backoff between transient-error retries.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Cap on the exponential backoff.
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_lock_timeout_ms() -> u64 {
    1000
}

fn default_dispatch_pool_size() -> usize {
    10
}

fn default_max_concurrent_runs() -> usize {
    10
}

fn default_max_task_attempts() -> u32 {
    3
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    50
}

fn default_retry_backoff_max_ms() -> u64 {
    2000
}

impl Default for ConfigSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            dispatch_pool_size: default_dispatch_pool_size(),
            max_concurrent_runs: default_max_concurrent_runs(),
            max_task_attempts: default_max_task_attempts(),
            namespace: default_namespace(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
        }
    }
}

/// `[task.<id>]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TaskConfig {
    /// Command run by the shell executor.
    #[serde(default)]
    pub cmd: Option<String>,

    /// Free-form metadata passed to the execution callback.
    #[serde(default)]
    pub payload: BTreeMap<String, String>,
}

/// `[dag.<id>]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DagConfig {
    /// Nodes of the DAG from `[dag.<id>.task.<task>]`; keys must name
    /// configured tasks.
    #[serde(default)]
    pub task: BTreeMap<String, DagTaskConfig>,
}

/// `[dag.<id>.task.<task>]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DagTaskConfig {
    /// Dependency list: this task waits for all tasks listed here, which must
    /// be nodes of the same DAG.
    #[serde(default)]
    pub after: Vec<String>,
}

/// `[schedule.<id>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// The DAG to run.
    pub dag: String,

    /// Number of occurrences; `0` repeats forever.
    #[serde(default = "default_repeat")]
    pub repeat: u32,

    /// Minimum time between the creation of consecutive occurrences.
    #[serde(default)]
    pub interval_ms: u64,
}

fn default_repeat() -> u32 {
    1
}

impl ScheduleConfig {
    pub fn repetition(&self) -> Repetition {
        let interval = Duration::from_millis(self.interval_ms);
        if self.repeat == 0 {
            Repetition::forever(interval)
        } else {
            Repetition::times(self.repeat, interval)
        }
    }
}
