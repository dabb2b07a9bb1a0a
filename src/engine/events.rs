// src/engine/events.rs

use tokio::sync::broadcast;
use tracing::trace;

use crate::state::TerminalReason;
use crate::types::{RunId, ScheduleId, TaskId};

/// Lifecycle notification emitted by a worker.
///
/// Run-level events come from the worker that won the corresponding write
/// (`RunStarted`, `RunCompleted`) or, for `RunCanceled`, from every worker
/// that observes the cancellation, once per run. Task events come from the
/// worker executing the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowEvent {
    RunStarted {
        run_id: RunId,
        schedule_id: ScheduleId,
        occurrence: u32,
    },
    RunCompleted {
        run_id: RunId,
    },
    RunCanceled {
        run_id: RunId,
        reason: Option<TerminalReason>,
    },
    TaskStarted {
        run_id: RunId,
        task_id: TaskId,
        attempt: u32,
    },
    TaskCompleted {
        run_id: RunId,
        task_id: TaskId,
    },
    TaskFailed {
        run_id: RunId,
        task_id: TaskId,
        reason: String,
        attempts: u32,
    },
}

impl WorkflowEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            WorkflowEvent::RunStarted { run_id, .. }
            | WorkflowEvent::RunCompleted { run_id }
            | WorkflowEvent::RunCanceled { run_id, .. }
            | WorkflowEvent::TaskStarted { run_id, .. }
            | WorkflowEvent::TaskCompleted { run_id, .. }
            | WorkflowEvent::TaskFailed { run_id, .. } => run_id,
        }
    }
}

const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast channel for [`WorkflowEvent`]s.
///
/// Cheap to clone; several workers may share one bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkflowEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: WorkflowEvent) {
        trace!(?event, "workflow event");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}
