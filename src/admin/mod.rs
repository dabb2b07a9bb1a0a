// src/admin/mod.rs

//! Operator surface: run reports, cleaning and stopping.
//!
//! These are the only public mutation entry points besides the scheduler
//! itself. All of them act on persisted state through [`RunStateStore`], so
//! they can run in any process connected to the namespace.
//!
//! [`RunStateStore`]: crate::state::RunStateStore

pub mod cleaner;
pub mod report;
pub mod stopper;

pub use cleaner::Cleaner;
pub use report::{AllRunReports, RunReport};
pub use stopper::Stopper;
