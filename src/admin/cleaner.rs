// src/admin/cleaner.rs

use tracing::info;

use crate::errors::{FlockError, Result};
use crate::state::RunStateStore;
use crate::types::RunId;

/// Moves terminal runs out of the active namespace.
#[derive(Debug, Clone)]
pub struct Cleaner {
    store: RunStateStore,
}

impl Cleaner {
    pub fn new(store: RunStateStore) -> Self {
        Self { store }
    }

    /// Archive a terminal run, then delete its active state.
    ///
    /// Fails without mutating anything for an unknown run
    /// ([`FlockError::RunNotFound`]), an archived one
    /// ([`FlockError::RunAlreadyArchived`]) or one that is still running
    /// ([`FlockError::RunNotTerminal`]).
    pub async fn clean(&self, run_id: &RunId) -> Result<()> {
        let Some(mut state) = self.store.read_run_state(run_id).await? else {
            return Err(self.missing(run_id).await?);
        };

        if !state.status().is_terminal() {
            return Err(FlockError::RunNotTerminal(run_id.clone()));
        }

        // Freeze a derived completion so the archive carries it.
        if state.terminal.is_none() {
            self.store.mark_run_completed(run_id).await?;
            match self.store.read_run_state(run_id).await? {
                Some(fresh) => state = fresh,
                None => return Err(self.missing(run_id).await?),
            }
        }

        // Archive first: readers see either the active or the archived copy.
        if !self.store.archive_run(&state).await? {
            return Err(FlockError::RunAlreadyArchived(run_id.clone()));
        }
        self.store.delete_active_run(run_id).await?;

        info!(run_id = %run_id, status = %state.status(), "run cleaned");
        Ok(())
    }

    async fn missing(&self, run_id: &RunId) -> Result<FlockError> {
        Ok(if self.store.is_archived(run_id).await? {
            FlockError::RunAlreadyArchived(run_id.clone())
        } else {
            FlockError::RunNotFound(run_id.clone())
        })
    }
}
