// src/engine/manager.rs

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::coord::SharedCoordinator;
use crate::definitions::DefinitionSource;
use crate::engine::events::{EventBus, WorkflowEvent};
use crate::engine::scheduler::Scheduler;
use crate::engine::SchedulerOptions;
use crate::errors::{Error, FlockError, Result};
use crate::exec::SharedExecutor;
use crate::state::RunStateStore;

/// One worker: a coordination session plus the scheduler loop driving it.
///
/// Dropping the manager without [`shutdown`](Self::shutdown) leaves the loop
/// running until the runtime stops.
#[derive(Debug)]
pub struct WorkflowManager {
    store: RunStateStore,
    events: EventBus,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<()>>,
}

impl WorkflowManager {
    /// Spawn a worker on the current Tokio runtime.
    pub fn start(
        coord: SharedCoordinator,
        options: SchedulerOptions,
        definitions: Arc<dyn DefinitionSource>,
        executor: SharedExecutor,
    ) -> Self {
        Self::start_with_events(coord, options, definitions, executor, EventBus::default())
    }

    /// Like [`start`](Self::start), publishing lifecycle events on `events`.
    ///
    /// Subscribe to the bus before starting to observe the very first events.
    pub fn start_with_events(
        coord: SharedCoordinator,
        options: SchedulerOptions,
        definitions: Arc<dyn DefinitionSource>,
        executor: SharedExecutor,
        events: EventBus,
    ) -> Self {
        let store = RunStateStore::new(coord, options.namespace.clone(), options.retry);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(instance = %store.instance_id(), "starting workflow manager");

        let scheduler = Scheduler::new(
            store.clone(),
            definitions,
            executor,
            options,
            events.clone(),
            shutdown_rx,
        );
        let handle = tokio::spawn(scheduler.run());

        Self {
            store,
            events,
            shutdown_tx,
            handle,
        }
    }

    /// Identifier of this worker; equal to its coordination session id.
    pub fn instance_id(&self) -> &str {
        self.store.instance_id()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &RunStateStore {
        &self.store
    }

    /// Whether the loop has exited (after shutdown or a lost session).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel local executions, stop the loop and close the session, which
    /// releases every claim this worker still holds.
    ///
    /// Returns the loop's error if it had already failed.
    pub async fn shutdown(self) -> Result<()> {
        info!(instance = %self.store.instance_id(), "shutting down workflow manager");
        let _ = self.shutdown_tx.send(true);

        let loop_result = match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(FlockError::Other(Error::new(e).context("scheduler loop panicked"))),
        };

        if let Err(e) = self.store.coordinator().close().await {
            warn!(error = %e, "failed to close coordination session");
        }

        loop_result
    }
}
