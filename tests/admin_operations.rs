use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use flockdag::admin::RunReport;
use flockdag::engine::{EventBus, WorkflowEvent};
use flockdag::errors::FlockError;
use flockdag::state::TerminalReason;
use flockdag::types::{RunId, RunStatus, ScheduleId, TaskId};
use flockdag_test_utils::builders::six_task_definitions;
use flockdag_test_utils::flock::Flock;
use flockdag_test_utils::recording_executor::RecordingExecutor;
use flockdag_test_utils::{
    fast_options, init_tracing, next_event_matching, wait_for_status, wait_until,
};

type TestResult = Result<(), Box<dyn Error>>;

const WITHIN: Duration = Duration::from_secs(5);

/// One six-task run whose `task1` blocks until released.
fn blocked_flock(workers: usize, events: EventBus) -> (Flock, RecordingExecutor) {
    let executor = RecordingExecutor::new().blocking("task1");
    let flock = Flock::start_with_events(
        workers,
        fast_options(),
        six_task_definitions(1, Duration::ZERO),
        Arc::new(executor.clone()),
        events,
    );
    (flock, executor)
}

async fn wait_for_blocked(flock: &Flock, run: &RunId) {
    let store = flock.admin().clone();
    let run = run.clone();
    let reached = wait_until(WITHIN, || {
        let store = store.clone();
        let run = run.clone();
        async move {
            let report = RunReport::load(&store, &run).await.expect("report");
            report.running.contains_key(&TaskId::new("task1"))
                && report.completed.contains_key(&TaskId::new("task2"))
        }
    })
    .await;
    assert!(reached, "task1 never blocked while task2 completed");
}

#[tokio::test]
async fn report_shows_progress_of_a_running_run() -> TestResult {
    init_tracing();

    let (flock, executor) = blocked_flock(2, EventBus::default());
    let run = RunId::new("main-0");
    wait_for_blocked(&flock, &run).await;

    let report = RunReport::load(flock.admin(), &run).await?;
    assert!(report.is_valid());
    assert!(!report.is_archived());
    assert_eq!(report.status(), Some(RunStatus::Running));
    assert_eq!(report.completed_count(), 1);
    assert_eq!(report.running_count(), 1);
    assert!(report.terminal_reason.is_none());

    let running = &report.running[&TaskId::new("task1")];
    assert!(flock.workers.iter().any(|w| w.instance_id() == running.instance));
    assert_eq!(running.attempt, 1);

    let rendered = report.to_string();
    assert!(rendered.contains("main-0"), "{rendered}");
    assert!(rendered.contains("RUNNING"), "{rendered}");

    let all = flock.reports().await;
    assert_eq!(all.len(), 1);
    assert!(!all.all_terminal());

    executor.release();
    wait_for_status(flock.admin(), &run, RunStatus::Completed, WITHIN).await;
    assert!(flock.reports().await.all_terminal());

    flock.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn report_of_unknown_run_is_invalid() -> TestResult {
    init_tracing();

    let flock = Flock::start(
        1,
        fast_options(),
        six_task_definitions(1, Duration::ZERO),
        Arc::new(RecordingExecutor::new()),
    );

    let report = RunReport::load(flock.admin(), &RunId::new("nope-0")).await?;
    assert!(!report.is_valid());
    assert_eq!(report.status(), None);
    assert_eq!(report.completed_count(), 0);
    assert!(RunReport::load_archived(flock.admin(), &RunId::new("nope-0")).await?.is_none());

    flock.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn stopping_a_run_force_fails_it_and_cancels_local_work() -> TestResult {
    init_tracing();

    let events = EventBus::default();
    let mut rx = events.subscribe();
    let (flock, executor) = blocked_flock(2, events);
    let run = RunId::new("main-0");
    let stopper = flock.stopper();

    assert!(matches!(
        stopper.stop(&RunId::new("unknown-0")).await,
        Err(FlockError::RunNotFound(_))
    ));

    wait_for_blocked(&flock, &run).await;

    assert!(stopper.stop(&run).await?, "first stop applies");
    assert!(!stopper.stop(&run).await?, "second stop is a no-op");

    let report = wait_for_status(flock.admin(), &run, RunStatus::ForceFailed, WITHIN).await;
    assert_eq!(report.terminal_reason, Some(TerminalReason::Operator));

    let canceled = next_event_matching(&mut rx, WITHIN, |e| {
        matches!(e, WorkflowEvent::RunCanceled { .. })
    })
    .await;
    assert_eq!(
        canceled,
        WorkflowEvent::RunCanceled {
            run_id: run.clone(),
            reason: Some(TerminalReason::Operator),
        }
    );

    let cancelled = wait_until(WITHIN, || {
        let executor = executor.clone();
        async move { executor.cancelled().len() == 1 }
    })
    .await;
    assert!(cancelled, "blocked execution was not cancelled");

    let released = wait_until(WITHIN, || {
        let store = flock.admin().clone();
        let run = run.clone();
        async move {
            RunReport::load(&store, &run).await.expect("report").running_count() == 0
        }
    })
    .await;
    assert!(released, "claim of the cancelled task was not released");

    // Nothing downstream of the blocked task is ever claimed.
    tokio::time::sleep(Duration::from_millis(200)).await;
    for task in ["task3", "task4", "task5", "task6"] {
        assert_eq!(executor.count(&run, task), 0, "{task} ran after stop");
    }
    let report = RunReport::load(flock.admin(), &run).await?;
    assert_eq!(report.status(), Some(RunStatus::ForceFailed));
    assert_eq!(report.completed_count(), 1);

    executor.release();
    flock.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn stopping_a_completed_run_does_nothing() -> TestResult {
    init_tracing();

    let flock = Flock::start(
        1,
        fast_options(),
        six_task_definitions(1, Duration::ZERO),
        Arc::new(RecordingExecutor::new()),
    );
    let run = RunId::new("main-0");
    wait_for_status(flock.admin(), &run, RunStatus::Completed, WITHIN).await;

    assert!(!flock.stopper().stop(&run).await?);
    let report = RunReport::load(flock.admin(), &run).await?;
    assert_eq!(report.status(), Some(RunStatus::Completed));

    flock.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn cleaning_archives_a_completed_run() -> TestResult {
    init_tracing();

    let (flock, executor) = blocked_flock(2, EventBus::default());
    let run = RunId::new("main-0");
    let cleaner = flock.cleaner();

    assert!(matches!(
        cleaner.clean(&RunId::new("unknown-0")).await,
        Err(FlockError::RunNotFound(_))
    ));

    wait_for_blocked(&flock, &run).await;
    assert!(matches!(
        cleaner.clean(&run).await,
        Err(FlockError::RunNotTerminal(_))
    ));
    assert!(flock.admin().run_exists(&run).await?);

    executor.release();
    wait_for_status(flock.admin(), &run, RunStatus::Completed, WITHIN).await;

    cleaner.clean(&run).await?;

    assert!(flock.reports().await.get(&run).is_none());
    assert!(!flock.admin().run_exists(&run).await?);
    assert!(!RunReport::load(flock.admin(), &run).await?.is_valid());

    let archived = RunReport::load_archived(flock.admin(), &run)
        .await?
        .expect("archived report");
    assert!(archived.is_archived());
    assert_eq!(archived.status(), Some(RunStatus::Completed));
    assert_eq!(archived.completed_count(), 6);

    assert!(matches!(
        cleaner.clean(&run).await,
        Err(FlockError::RunAlreadyArchived(_))
    ));

    // The occurrence record survives cleaning, so the run is not recreated.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!flock.admin().run_exists(&run).await?);
    assert_eq!(flock.admin().occurrences(&ScheduleId::new("main")).await?.len(), 1);

    flock.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn cleaning_a_stopped_run_keeps_its_reason() -> TestResult {
    init_tracing();

    let (flock, executor) = blocked_flock(1, EventBus::default());
    let run = RunId::new("main-0");
    wait_for_blocked(&flock, &run).await;

    assert!(flock.stopper().stop(&run).await?);
    flock.cleaner().clean(&run).await?;

    let archived = RunReport::load_archived(flock.admin(), &run)
        .await?
        .expect("archived report");
    assert_eq!(archived.status(), Some(RunStatus::ForceFailed));
    assert_eq!(archived.terminal_reason, Some(TerminalReason::Operator));
    assert!(flock.reports().await.is_empty());

    executor.release();
    flock.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn cleaned_runs_leave_no_watches_behind() -> TestResult {
    init_tracing();

    let flock = Flock::start(
        2,
        fast_options(),
        six_task_definitions(4, Duration::from_millis(30)),
        Arc::new(RecordingExecutor::new()),
    );
    let cleaner = flock.cleaner();

    for occurrence in 0..4 {
        let run = RunId::new(format!("main-{occurrence}"));
        wait_for_status(flock.admin(), &run, RunStatus::Completed, WITHIN).await;
        cleaner.clean(&run).await?;
    }

    // Each worker keeps watching the run list and nothing else.
    let ensemble = flock.ensemble.clone();
    let limit = flock.workers.len();
    let drained = wait_until(WITHIN, || {
        let ensemble = ensemble.clone();
        async move { ensemble.pending_watches() <= limit }
    })
    .await;
    assert!(
        drained,
        "{} watches still pending after cleaning every run",
        flock.ensemble.pending_watches()
    );

    flock.shutdown().await;
    Ok(())
}
