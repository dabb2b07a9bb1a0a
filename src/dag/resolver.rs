// src/dag/resolver.rs

use std::collections::BTreeSet;

use crate::dag::DagGraph;
use crate::types::TaskId;

/// Tasks that may be claimed now, in topological order.
///
/// A task is ready when every one of its dependencies is completed and it is
/// neither started nor completed itself. There are no waves: a task becomes
/// ready as soon as its own dependencies complete, regardless of unrelated
/// tasks still running.
pub fn ready_set(
    graph: &DagGraph,
    completed: &BTreeSet<TaskId>,
    started: &BTreeSet<TaskId>,
) -> Vec<TaskId> {
    graph
        .topological_order()
        .iter()
        .filter(|task| !completed.contains(*task) && !started.contains(*task))
        .filter(|task| {
            graph
                .dependencies_of(task)
                .iter()
                .all(|dep| completed.contains(dep))
        })
        .cloned()
        .collect()
}

/// Whether every task of the graph has completed.
pub fn is_complete(graph: &DagGraph, completed: &BTreeSet<TaskId>) -> bool {
    graph.tasks().all(|task| completed.contains(task))
}
