use std::sync::Arc;

use flockdag::admin::{AllRunReports, Cleaner, Stopper};
use flockdag::coord::{MemoryEnsemble, SharedCoordinator};
use flockdag::definitions::{DefinitionSource, Definitions, StaticDefinitions};
use flockdag::engine::{EventBus, SchedulerOptions, WorkflowEvent, WorkflowManager};
use flockdag::exec::SharedExecutor;
use flockdag::state::RunStateStore;
use tokio::sync::broadcast;

/// N workers sharing one in-memory ensemble, plus an admin session.
pub struct Flock {
    pub ensemble: MemoryEnsemble,
    pub workers: Vec<WorkflowManager>,
    pub events: EventBus,
    admin: RunStateStore,
    options: SchedulerOptions,
    definitions: Arc<dyn DefinitionSource>,
    executor: SharedExecutor,
}

impl Flock {
    /// Start `n` workers. Subscribe with [`Flock::subscribe_before`] semantics
    /// by passing a pre-subscribed bus through [`Flock::start_with_events`].
    pub fn start(
        n: usize,
        options: SchedulerOptions,
        definitions: Definitions,
        executor: SharedExecutor,
    ) -> Self {
        Self::start_with_events(n, options, definitions, executor, EventBus::default())
    }

    pub fn start_with_events(
        n: usize,
        options: SchedulerOptions,
        definitions: Definitions,
        executor: SharedExecutor,
        events: EventBus,
    ) -> Self {
        let ensemble = MemoryEnsemble::new();
        let definitions: Arc<dyn DefinitionSource> =
            Arc::new(StaticDefinitions::new(definitions));
        let admin = RunStateStore::new(
            Arc::new(ensemble.connect()),
            options.namespace.clone(),
            options.retry,
        );

        let mut flock = Self {
            ensemble,
            workers: Vec::new(),
            events,
            admin,
            options,
            definitions,
            executor,
        };
        for _ in 0..n {
            flock.add_worker();
        }
        flock
    }

    /// Start one more worker on a fresh session. Returns its index.
    pub fn add_worker(&mut self) -> usize {
        let coord: SharedCoordinator = Arc::new(self.ensemble.connect());
        self.workers.push(WorkflowManager::start_with_events(
            coord,
            self.options.clone(),
            Arc::clone(&self.definitions),
            Arc::clone(&self.executor),
            self.events.clone(),
        ));
        self.workers.len() - 1
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    /// Store bound to a session that does not run a scheduler.
    pub fn admin(&self) -> &RunStateStore {
        &self.admin
    }

    pub fn stopper(&self) -> Stopper {
        Stopper::new(self.admin.clone())
    }

    pub fn cleaner(&self) -> Cleaner {
        Cleaner::new(self.admin.clone())
    }

    pub async fn reports(&self) -> AllRunReports {
        AllRunReports::load(&self.admin)
            .await
            .expect("loading run reports")
    }

    /// Simulate a crash of worker `idx`: its session expires, its ephemeral
    /// claims vanish and its loop stops.
    pub fn crash(&self, idx: usize) -> usize {
        let session = self.workers[idx].instance_id().to_string();
        self.ensemble.expire_session(&session)
    }

    pub async fn shutdown(self) {
        for worker in self.workers {
            let _ = worker.shutdown().await;
        }
    }
}
