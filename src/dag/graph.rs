// src/dag/graph.rs

use std::collections::BTreeMap;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::definitions::TaskDagDefinition;
use crate::errors::{FlockError, Result};
use crate::types::{DagId, TaskId};

/// Internal node structure: stores immediate deps.
#[derive(Debug, Clone, Default)]
struct DagNode {
    /// Direct dependencies: tasks that must complete before this one can run.
    deps: Vec<TaskId>,
}

/// In-memory DAG keyed by task id.
///
/// Construction validates the graph, so every `DagGraph` is known to have
/// resolvable dependencies and no cycles.
#[derive(Debug, Clone)]
pub struct DagGraph {
    nodes: BTreeMap<TaskId, DagNode>,
    order: Vec<TaskId>,
}

impl DagGraph {
    pub fn from_definition(dag: &TaskDagDefinition) -> Result<Self> {
        Self::build(&dag.id, &dag.tasks)
    }

    /// Build and validate a graph from a `task -> prerequisites` map.
    ///
    /// Fails with [`FlockError::InvalidDag`] for an empty DAG, a dependency on
    /// a task that is not a node, or a task depending on itself, and with
    /// [`FlockError::DagCycle`] if the relation is cyclic.
    pub fn build(dag_id: &DagId, tasks: &BTreeMap<TaskId, Vec<TaskId>>) -> Result<Self> {
        if tasks.is_empty() {
            return Err(FlockError::InvalidDag(format!("dag '{dag_id}' has no tasks")));
        }

        let nodes: BTreeMap<TaskId, DagNode> = tasks
            .iter()
            .map(|(task, deps)| (task.clone(), DagNode { deps: deps.clone() }))
            .collect();

        for (task, deps) in tasks.iter() {
            for dep in deps {
                if dep == task {
                    return Err(FlockError::InvalidDag(format!(
                        "task '{task}' in dag '{dag_id}' depends on itself"
                    )));
                }
                if !nodes.contains_key(dep) {
                    return Err(FlockError::InvalidDag(format!(
                        "task '{task}' in dag '{dag_id}' depends on unknown task '{dep}'"
                    )));
                }
            }
        }

        // Edge direction: dep -> task.
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for task in tasks.keys() {
            graph.add_node(task.as_str());
        }
        for (task, deps) in tasks.iter() {
            for dep in deps {
                graph.add_edge(dep.as_str(), task.as_str(), ());
            }
        }

        let order = match toposort(&graph, None) {
            Ok(order) => order.into_iter().map(TaskId::from).collect(),
            Err(cycle) => {
                return Err(FlockError::DagCycle(format!(
                    "dag '{dag_id}' has a cycle involving task '{}'",
                    cycle.node_id()
                )));
            }
        };

        Ok(Self { nodes, order })
    }

    /// All task ids, sorted.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskId> {
        self.nodes.keys()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, task: &TaskId) -> bool {
        self.nodes.contains_key(task)
    }

    /// Immediate dependencies of a task.
    pub fn dependencies_of(&self, task: &TaskId) -> &[TaskId] {
        self.nodes
            .get(task)
            .map(|n| n.deps.as_slice())
            .unwrap_or(&[])
    }

    /// Tasks without dependencies.
    pub fn roots(&self) -> impl Iterator<Item = &TaskId> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.deps.is_empty())
            .map(|(task, _)| task)
    }

    /// Every task, each after all of its dependencies.
    pub fn topological_order(&self) -> &[TaskId] {
        &self.order
    }
}
