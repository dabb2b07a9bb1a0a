#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use flockdag::config::{
    ConfigFile, ConfigSection, DagConfig, DagTaskConfig, RawConfigFile, ScheduleConfig, TaskConfig,
};
use flockdag::definitions::{
    Definitions, Repetition, ScheduleDefinition, TaskDagDefinition, TaskDefinition,
};
use flockdag::errors::Result;

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile::default(),
        }
    }

    pub fn with_config(mut self, section: ConfigSection) -> Self {
        self.config.config = section;
        self
    }

    pub fn with_task(mut self, name: &str, task: TaskConfig) -> Self {
        self.config.task.insert(name.to_string(), task);
        self
    }

    /// Add `task` to `dag`, creating the DAG if needed.
    pub fn with_dag_task(mut self, dag: &str, task: &str, after: &[&str]) -> Self {
        self.config
            .dag
            .entry(dag.to_string())
            .or_insert_with(DagConfig::default)
            .task
            .insert(
                task.to_string(),
                DagTaskConfig {
                    after: after.iter().map(|s| s.to_string()).collect(),
                },
            );
        self
    }

    pub fn with_schedule(mut self, name: &str, dag: &str, repeat: u32, interval_ms: u64) -> Self {
        self.config.schedule.insert(
            name.to_string(),
            ScheduleConfig {
                dag: dag.to_string(),
                repeat,
                interval_ms,
            },
        );
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn try_build(self) -> Result<ConfigFile> {
        ConfigFile::try_from(self.config)
    }

    pub fn build(self) -> ConfigFile {
        self.try_build()
            .expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `TaskConfig`.
pub struct TaskConfigBuilder {
    task: TaskConfig,
}

impl TaskConfigBuilder {
    pub fn new(cmd: &str) -> Self {
        Self {
            task: TaskConfig {
                cmd: Some(cmd.to_string()),
                payload: BTreeMap::new(),
            },
        }
    }

    /// A task without a command.
    pub fn noop() -> Self {
        Self {
            task: TaskConfig::default(),
        }
    }

    pub fn payload(mut self, key: &str, value: &str) -> Self {
        self.task.payload.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> TaskConfig {
        self.task
    }
}

/// Task ids of [`six_task_definitions`].
pub const SIX_TASKS: [&str; 6] = ["task1", "task2", "task3", "task4", "task5", "task6"];

/// The six-task DAG: `task1` and `task2` are roots, `task3`..`task5` depend
/// on both, `task6` depends on `task3`..`task5`. One schedule `main` runs it
/// `repeat` times, `interval` apart.
pub fn six_task_definitions(repeat: u32, interval: Duration) -> Definitions {
    let dag = TaskDagDefinition::new("six")
        .with_task("task1", Vec::<&str>::new())
        .with_task("task2", Vec::<&str>::new())
        .with_task("task3", ["task1", "task2"])
        .with_task("task4", ["task1", "task2"])
        .with_task("task5", ["task1", "task2"])
        .with_task("task6", ["task3", "task4", "task5"]);

    let mut definitions = Definitions::default()
        .with_dag(dag)
        .with_schedule(ScheduleDefinition::new(
            "main",
            "six",
            Repetition::times(repeat, interval),
        ));
    for task in SIX_TASKS {
        definitions = definitions.with_task(TaskDefinition::new(task));
    }
    definitions
}

/// A linear chain `a -> b -> c` run once by schedule `chain`.
pub fn chain_definitions() -> Definitions {
    let dag = TaskDagDefinition::new("chain")
        .with_task("a", Vec::<&str>::new())
        .with_task("b", ["a"])
        .with_task("c", ["b"]);

    Definitions::default()
        .with_dag(dag)
        .with_schedule(ScheduleDefinition::new("chain", "chain", Repetition::once()))
        .with_task(TaskDefinition::new("a"))
        .with_task(TaskDefinition::new("b"))
        .with_task(TaskDefinition::new("c"))
}
