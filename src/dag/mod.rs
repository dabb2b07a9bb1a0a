// src/dag/mod.rs

//! DAG representation and ready-set resolution.
//!
//! - [`graph`] holds a validated directed acyclic graph of tasks.
//! - [`snapshot`] is the resolved copy of a DAG stored with every run.
//! - [`resolver`] computes which tasks of a run may be claimed next.

pub mod graph;
pub mod resolver;
pub mod snapshot;

pub use graph::DagGraph;
pub use resolver::{is_complete, ready_set};
pub use snapshot::DagSnapshot;
