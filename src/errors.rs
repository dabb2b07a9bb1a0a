// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;

use crate::coord::CoordError;
use crate::types::{RunId, TaskId};

#[derive(Error, Debug)]
pub enum FlockError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Invalid DAG definition: {0}")]
    InvalidDag(String),

    #[error("Cycle detected in DAG: {0}")]
    DagCycle(String),

    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Run {0} is still running; only terminal runs can be cleaned")]
    RunNotTerminal(RunId),

    #[error("Run {0} has already been archived")]
    RunAlreadyArchived(RunId),

    #[error("Claim on task '{task}' of run {run_id} is not held by this instance")]
    ClaimLost { run_id: RunId, task: TaskId },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, FlockError>;
