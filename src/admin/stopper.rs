// src/admin/stopper.rs

use tracing::info;

use crate::errors::{FlockError, Result};
use crate::state::{RunStateStore, TerminalReason};
use crate::types::{RunId, RunStatus};

/// Force-fails runs on operator request.
///
/// Stopping does not interrupt executions directly: every worker observes
/// the terminal record, stops claiming tasks of the run and signals its own
/// in-flight executions to cancel.
#[derive(Debug, Clone)]
pub struct Stopper {
    store: RunStateStore,
}

impl Stopper {
    pub fn new(store: RunStateStore) -> Self {
        Self { store }
    }

    /// Returns `true` if this call force-failed the run, `false` if the run
    /// was already terminal.
    pub async fn stop(&self, run_id: &RunId) -> Result<bool> {
        let Some(state) = self.store.read_run_state(run_id).await? else {
            return Err(FlockError::RunNotFound(run_id.clone()));
        };

        if state.status().is_terminal() {
            return Ok(false);
        }

        if !self
            .store
            .mark_run_force_failed(run_id, TerminalReason::Operator)
            .await?
        {
            return Ok(false);
        }

        // The last task may have completed between the read and the write;
        // such a run stays completed.
        let stopped = match self.store.read_run_state(run_id).await? {
            Some(state) => state.status() == RunStatus::ForceFailed,
            None => true,
        };
        if stopped {
            info!(run_id = %run_id, "run stopped by operator");
        } else {
            info!(run_id = %run_id, "run completed before the stop landed");
        }
        Ok(stopped)
    }
}
