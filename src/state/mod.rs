// src/state/mod.rs

//! Persisted per-run state.
//!
//! Every fact about a run lives in the coordination namespace (see
//! [`crate::coord::paths`]). [`RunStateStore`] is the only writer; reports and
//! administrative tools read through it too.

pub mod records;
pub mod store;

pub use records::{
    ArchivedRun, CompletedTask, OccurrenceRecord, RunRecord, RunState, StartedTask, TaskFailure,
    TaskResult, TerminalReason, TerminalRecord,
};
pub use store::{ClaimOutcome, CreateRunOutcome, RunStateStore};
