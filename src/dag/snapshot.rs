// src/dag/snapshot.rs

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::dag::DagGraph;
use crate::definitions::{TaskDagDefinition, TaskDefinition};
use crate::errors::{FlockError, Result};
use crate::types::{DagId, TaskId};

/// Resolved copy of a DAG and the definitions of its tasks.
///
/// Stored inside every run record, so a run keeps the shape it was created
/// with even if definitions change later, and any worker can drive it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagSnapshot {
    pub dag: TaskDagDefinition,
    pub tasks: BTreeMap<TaskId, TaskDefinition>,
}

impl DagSnapshot {
    /// Resolve `dag` against the configured task definitions.
    pub fn resolve(
        dag: &TaskDagDefinition,
        tasks: &BTreeMap<TaskId, TaskDefinition>,
    ) -> Result<Self> {
        DagGraph::from_definition(dag)?;

        let mut resolved = BTreeMap::new();
        for task in dag.tasks.keys() {
            let definition = tasks.get(task).ok_or_else(|| {
                FlockError::InvalidDag(format!(
                    "dag '{}' references undefined task '{task}'",
                    dag.id
                ))
            })?;
            resolved.insert(task.clone(), definition.clone());
        }

        Ok(Self {
            dag: dag.clone(),
            tasks: resolved,
        })
    }

    pub fn dag_id(&self) -> &DagId {
        &self.dag.id
    }

    /// Re-validate and build the graph.
    ///
    /// Snapshots read back from storage go through this again, so a corrupted
    /// record surfaces as a definition error rather than a stuck run.
    pub fn graph(&self) -> Result<DagGraph> {
        let graph = DagGraph::from_definition(&self.dag)?;
        if let Some(missing) = self.dag.tasks.keys().find(|t| !self.tasks.contains_key(*t)) {
            return Err(FlockError::InvalidDag(format!(
                "snapshot of dag '{}' lacks the definition of task '{missing}'",
                self.dag.id
            )));
        }
        Ok(graph)
    }

    pub fn task(&self, task: &TaskId) -> Option<&TaskDefinition> {
        self.tasks.get(task)
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.dag.tasks.keys()
    }

    pub fn len(&self) -> usize {
        self.dag.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dag.tasks.is_empty()
    }
}
