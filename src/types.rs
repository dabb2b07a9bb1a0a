// src/types.rs

//! Identifier newtypes and the derived run status shared across modules.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of a task definition (and of its node inside a DAG).
    TaskId
);
string_id!(
    /// Identifier of a task DAG definition.
    DagId
);
string_id!(
    /// Identifier of a schedule definition.
    ScheduleId
);
string_id!(
    /// Identifier of one run of a schedule's DAG.
    ///
    /// Run ids are deterministic (`<schedule>-<occurrence>`) so that every
    /// worker racing for the same occurrence computes the same claim path.
    RunId
);

impl RunId {
    pub fn for_occurrence(schedule: &ScheduleId, occurrence: u32) -> Self {
        Self(format!("{}-{}", schedule, occurrence))
    }
}

/// Externally visible status of a run.
///
/// Derived from persisted markers: a terminal record wins; otherwise a run
/// whose every task has a completed marker is `Completed`; otherwise it is
/// `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    ForceFailed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::ForceFailed => "FORCE_FAILED",
        };
        f.write_str(s)
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "force_failed" => Ok(RunStatus::ForceFailed),
            other => Err(format!(
                "invalid run status: {other} (expected \"running\", \"completed\" or \"force_failed\")"
            )),
        }
    }
}
