use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use flockdag::admin::RunReport;
use flockdag::coord::{MemoryEnsemble, RetryPolicy};
use flockdag::definitions::{DefinitionSource, StaticDefinitions};
use flockdag::engine::{EventBus, WorkflowEvent, WorkflowManager};
use flockdag::state::{RunStateStore, TerminalReason};
use flockdag::types::{RunId, RunStatus, TaskId};
use flockdag_test_utils::builders::{chain_definitions, six_task_definitions};
use flockdag_test_utils::flock::Flock;
use flockdag_test_utils::hooked::HookedCoordinator;
use flockdag_test_utils::recording_executor::RecordingExecutor;
use flockdag_test_utils::{
    fast_options, init_tracing, next_event_matching, wait_for_status, wait_until,
};

type TestResult = Result<(), Box<dyn Error>>;

const WITHIN: Duration = Duration::from_secs(5);

#[tokio::test]
async fn claims_of_a_crashed_worker_are_taken_over() -> TestResult {
    init_tracing();

    let executor = RecordingExecutor::new().blocking("task1");
    let mut flock = Flock::start(
        1,
        fast_options(),
        six_task_definitions(1, Duration::ZERO),
        Arc::new(executor.clone()),
    );
    let run = RunId::new("main-0");

    let claimed = wait_until(WITHIN, || {
        let executor = executor.clone();
        let run = run.clone();
        async move { executor.count(&run, "task1") == 1 }
    })
    .await;
    assert!(claimed, "task1 was never started");

    let crashed = flock.workers[0].instance_id().to_string();
    assert!(flock.crash(0) >= 1, "the crashed worker held ephemeral claims");
    assert!(!flock.ensemble.is_session_alive(&crashed));

    let report = RunReport::load(flock.admin(), &run).await?;
    assert!(!report.running.contains_key(&TaskId::new("task1")));

    flock.add_worker();
    let retaken = wait_until(WITHIN, || {
        let executor = executor.clone();
        let run = run.clone();
        async move { executor.count(&run, "task1") == 2 }
    })
    .await;
    assert!(retaken, "task1 was not picked up by the new worker");

    executor.release();
    let report = wait_for_status(flock.admin(), &run, RunStatus::Completed, WITHIN).await;
    assert_eq!(report.completed_count(), 6);
    assert_ne!(report.completed[&TaskId::new("task1")].instance, crashed);

    let stopped = wait_until(WITHIN, || {
        let finished = flock.workers[0].is_finished();
        async move { finished }
    })
    .await;
    assert!(stopped, "the crashed worker's loop kept running");

    flock.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn repeated_failures_force_fail_the_run() -> TestResult {
    init_tracing();

    let events = EventBus::default();
    let mut rx = events.subscribe();
    let executor = RecordingExecutor::new().failing("task3", 10);
    let flock = Flock::start_with_events(
        2,
        fast_options(),
        six_task_definitions(1, Duration::ZERO),
        Arc::new(executor.clone()),
        events,
    );
    let run = RunId::new("main-0");

    let report = wait_for_status(flock.admin(), &run, RunStatus::ForceFailed, WITHIN).await;
    let exhausted = TerminalReason::TaskExhausted {
        task: TaskId::new("task3"),
        attempts: 3,
    };
    assert_eq!(report.terminal_reason, Some(exhausted.clone()));
    assert_eq!(report.failed_attempts[&TaskId::new("task3")], 3);

    let canceled = next_event_matching(&mut rx, WITHIN, |e| {
        matches!(e, WorkflowEvent::RunCanceled { .. })
    })
    .await;
    assert_eq!(
        canceled,
        WorkflowEvent::RunCanceled {
            run_id: run.clone(),
            reason: Some(exhausted),
        }
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(executor.count(&run, "task3"), 3);
    assert_eq!(executor.count(&run, "task6"), 0);

    let attempts: Vec<u32> = executor
        .executions()
        .iter()
        .filter(|e| e.task_id.as_str() == "task3")
        .map(|e| e.attempt)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    flock.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn a_task_that_recovers_within_its_attempts_completes_the_run() -> TestResult {
    init_tracing();

    let events = EventBus::default();
    let mut rx = events.subscribe();
    let executor = RecordingExecutor::new().failing("task3", 2);
    let flock = Flock::start_with_events(
        2,
        fast_options(),
        six_task_definitions(1, Duration::ZERO),
        Arc::new(executor.clone()),
        events,
    );
    let run = RunId::new("main-0");

    let report = wait_for_status(flock.admin(), &run, RunStatus::Completed, WITHIN).await;
    assert_eq!(report.completed_count(), 6);
    assert_eq!(report.failed_attempts[&TaskId::new("task3")], 2);
    assert!(report.terminal_reason.is_none());
    assert_eq!(executor.count(&run, "task3"), 3);

    let failed = next_event_matching(&mut rx, WITHIN, |e| {
        matches!(e, WorkflowEvent::TaskFailed { .. })
    })
    .await;
    match failed {
        WorkflowEvent::TaskFailed { task_id, attempts, .. } => {
            assert_eq!(task_id, TaskId::new("task3"));
            assert_eq!(attempts, 1);
        }
        other => panic!("unexpected event {other:?}"),
    }

    flock.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn zero_max_attempts_retries_without_bound() -> TestResult {
    init_tracing();

    let mut options = fast_options();
    options.max_task_attempts = 0;
    let executor = RecordingExecutor::new().failing("task6", 5);
    let flock = Flock::start(
        1,
        options,
        six_task_definitions(1, Duration::ZERO),
        Arc::new(executor.clone()),
    );
    let run = RunId::new("main-0");

    let report = wait_for_status(flock.admin(), &run, RunStatus::Completed, WITHIN).await;
    assert_eq!(report.failed_attempts[&TaskId::new("task6")], 5);
    assert_eq!(executor.count(&run, "task6"), 6);

    flock.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn transient_connection_loss_does_not_stop_progress() -> TestResult {
    init_tracing();

    let executor = RecordingExecutor::new().with_delay(Duration::from_millis(10));
    let flock = Flock::start(
        3,
        fast_options(),
        six_task_definitions(2, Duration::from_millis(30)),
        Arc::new(executor.clone()),
    );

    for _ in 0..5 {
        flock.ensemble.inject_connection_loss(2);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    for run in ["main-0", "main-1"] {
        let run = RunId::new(run);
        let report = wait_for_status(flock.admin(), &run, RunStatus::Completed, WITHIN).await;
        assert_eq!(report.completed_count(), 6);
    }
    for ((run, task), successes) in executor.successes() {
        assert_eq!(successes, 1, "{task} in {run} succeeded {successes} times");
    }
    assert!(flock.workers.iter().all(|w| !w.is_finished()));

    flock.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn claim_is_released_when_a_failure_cannot_be_recorded() -> TestResult {
    init_tracing();

    let options = fast_options();
    let ns = options.namespace.clone();
    let ensemble = MemoryEnsemble::new();
    let run = RunId::new("chain-0");

    // Every attempt to record the first failure of `a` hits a lost connection.
    let attempts = options.retry.max_attempts;
    let flaky = ensemble.clone();
    let coord = Arc::new(HookedCoordinator::before_create(
        ensemble.connect(),
        ns.failed_attempt_prefix(&run, &TaskId::new("a")),
        move || async move { flaky.inject_connection_loss(attempts) },
    ));

    let events = EventBus::default();
    let mut rx = events.subscribe();
    let executor = RecordingExecutor::new().failing("a", 1);
    let definitions: Arc<dyn DefinitionSource> =
        Arc::new(StaticDefinitions::new(chain_definitions()));
    let worker = WorkflowManager::start_with_events(
        coord.clone(),
        options,
        definitions,
        Arc::new(executor.clone()),
        events,
    );

    next_event_matching(&mut rx, WITHIN, |e| {
        matches!(e, WorkflowEvent::RunCompleted { run_id } if run_id == &run)
    })
    .await;
    assert!(coord.fired());

    let admin = RunStateStore::new(Arc::new(ensemble.connect()), ns, RetryPolicy::none());
    let state = admin.read_run_state(&run).await?.expect("run exists");
    assert_eq!(state.failed_attempts(&TaskId::new("a")), 1);
    // The unrecorded failure, the recorded one, then the success.
    assert_eq!(executor.count(&run, "a"), 3, "{:#?}", executor.executions());

    worker.shutdown().await?;
    Ok(())
}
