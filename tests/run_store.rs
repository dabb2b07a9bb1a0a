use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;

use flockdag::coord::{MemoryEnsemble, Namespace, RetryPolicy};
use flockdag::dag::DagSnapshot;
use flockdag::definitions::TaskDefinition;
use flockdag::errors::FlockError;
use flockdag::state::{ClaimOutcome, CreateRunOutcome, RunStateStore, TaskResult, TerminalReason};
use flockdag::types::{DagId, RunId, RunStatus, ScheduleId, TaskId};
use flockdag_test_utils::builders::chain_definitions;
use flockdag_test_utils::init_tracing;

type TestResult = Result<(), Box<dyn Error>>;

fn store(ensemble: &MemoryEnsemble) -> RunStateStore {
    RunStateStore::new(
        Arc::new(ensemble.connect()),
        Namespace::new("/test"),
        RetryPolicy::none(),
    )
}

fn chain_snapshot() -> DagSnapshot {
    let defs = chain_definitions();
    DagSnapshot::resolve(&defs.dags[&DagId::new("chain")], &defs.tasks).expect("valid snapshot")
}

async fn created_run(store: &RunStateStore) -> RunId {
    match store
        .try_create_run(&ScheduleId::new("chain"), 0, chain_snapshot())
        .await
        .expect("create run")
    {
        CreateRunOutcome::Created(record) => record.run_id,
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn run_creation_has_one_winner_and_records_the_occurrence() -> TestResult {
    init_tracing();

    let ensemble = MemoryEnsemble::new();
    let a = store(&ensemble);
    let b = store(&ensemble);
    let schedule = ScheduleId::new("chain");

    let first = a.try_create_run(&schedule, 0, chain_snapshot()).await?;
    let second = b.try_create_run(&schedule, 0, chain_snapshot()).await?;

    let CreateRunOutcome::Created(record) = first else {
        panic!("first creator should win");
    };
    assert_eq!(record.run_id, RunId::new("chain-0"));
    assert_eq!(record.created_by, a.instance_id());
    assert_eq!(second, CreateRunOutcome::AlreadyExists(RunId::new("chain-0")));

    let occurrences = b.occurrences(&schedule).await?;
    assert_eq!(occurrences.len(), 1);
    assert_eq!(occurrences[&0].run_id, record.run_id);
    assert_eq!(occurrences[&0].created_at, record.created_at);

    assert_eq!(a.list_active_run_ids().await?, vec![RunId::new("chain-0")]);
    Ok(())
}

#[tokio::test]
async fn invalid_snapshot_creates_nothing() -> TestResult {
    let ensemble = MemoryEnsemble::new();
    let s = store(&ensemble);

    let mut snapshot = chain_snapshot();
    snapshot
        .dag
        .tasks
        .insert(TaskId::new("a"), vec![TaskId::new("c")]);

    let err = s
        .try_create_run(&ScheduleId::new("chain"), 0, snapshot)
        .await
        .unwrap_err();
    assert!(matches!(err, FlockError::DagCycle(_)), "{err:?}");
    assert!(s.list_active_run_ids().await?.is_empty());
    assert!(s.occurrences(&ScheduleId::new("chain")).await?.is_empty());
    Ok(())
}

#[test]
fn snapshot_requires_every_task_definition() {
    let defs = chain_definitions();
    let mut tasks: BTreeMap<TaskId, TaskDefinition> = defs.tasks.clone();
    tasks.remove(&TaskId::new("b"));

    let err = DagSnapshot::resolve(&defs.dags[&DagId::new("chain")], &tasks).unwrap_err();
    assert!(matches!(err, FlockError::InvalidDag(_)), "{err:?}");
}

#[tokio::test]
async fn task_claims_are_exclusive() -> TestResult {
    init_tracing();

    let ensemble = MemoryEnsemble::new();
    let a = store(&ensemble);
    let b = store(&ensemble);
    let run = created_run(&a).await;
    let task = TaskId::new("a");

    assert_eq!(a.mark_task_started(&run, &task, 1).await?, ClaimOutcome::Granted);
    assert_eq!(b.mark_task_started(&run, &task, 1).await?, ClaimOutcome::AlreadyStarted);
    // Re-claiming one's own marker is idempotent.
    assert_eq!(a.mark_task_started(&run, &task, 1).await?, ClaimOutcome::Granted);

    let err = b
        .mark_task_completed(&run, &task, TaskResult::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FlockError::ClaimLost { .. }), "{err:?}");

    a.mark_task_completed(&run, &task, TaskResult::with_message("ok"))
        .await?;
    // Completing twice is a no-op.
    b.mark_task_completed(&run, &task, TaskResult::default()).await?;

    let state = b.read_run_state(&run).await?.expect("run exists");
    assert_eq!(state.completed[&task].instance, a.instance_id());
    assert_eq!(state.completed[&task].result.message, "ok");
    assert!(state.running_tasks().is_empty());
    Ok(())
}

#[tokio::test]
async fn completed_task_is_never_granted_again() -> TestResult {
    init_tracing();

    let ensemble = MemoryEnsemble::new();
    let a = store(&ensemble);
    let b = store(&ensemble);
    let run = created_run(&a).await;
    let task = TaskId::new("a");

    assert_eq!(a.mark_task_started(&run, &task, 1).await?, ClaimOutcome::Granted);
    a.mark_task_completed(&run, &task, TaskResult::default()).await?;

    // The completer goes away, taking its ephemeral claim with it.
    ensemble.expire_session(a.instance_id());

    assert_eq!(
        b.mark_task_started(&run, &task, 1).await?,
        ClaimOutcome::AlreadyCompleted
    );
    let state = b.read_run_state(&run).await?.expect("run exists");
    assert!(state.started.is_empty());
    Ok(())
}

#[tokio::test]
async fn failures_accumulate_and_claims_can_be_abandoned() -> TestResult {
    let ensemble = MemoryEnsemble::new();
    let a = store(&ensemble);
    let b = store(&ensemble);
    let run = created_run(&a).await;
    let task = TaskId::new("a");

    assert_eq!(a.mark_task_started(&run, &task, 1).await?, ClaimOutcome::Granted);
    assert_eq!(a.record_task_failure(&run, &task, "boom").await?, 1);
    assert!(!b.abandon_task(&run, &task).await?, "not b's claim");
    assert!(a.abandon_task(&run, &task).await?);

    assert_eq!(b.mark_task_started(&run, &task, 2).await?, ClaimOutcome::Granted);
    assert_eq!(b.record_task_failure(&run, &task, "boom again").await?, 2);

    let state = a.read_run_state(&run).await?.expect("run exists");
    assert_eq!(state.failed_attempts(&task), 2);
    assert_eq!(state.failures[&task][0].reason, "boom");
    assert_eq!(state.failures[&task][1].instance, b.instance_id());
    assert_eq!(state.started[&task].attempt, 2);
    Ok(())
}

#[tokio::test]
async fn terminal_state_is_written_once() -> TestResult {
    let ensemble = MemoryEnsemble::new();
    let a = store(&ensemble);
    let b = store(&ensemble);
    let run = created_run(&a).await;

    assert!(b.mark_run_force_failed(&run, TerminalReason::Operator).await?);
    assert!(!a.mark_run_completed(&run).await?);
    assert!(!a.mark_run_force_failed(&run, TerminalReason::Operator).await?);

    let state = a.read_run_state(&run).await?.expect("run exists");
    assert_eq!(state.status(), RunStatus::ForceFailed);
    let terminal = state.terminal.expect("terminal record");
    assert_eq!(terminal.instance, b.instance_id());
    assert_eq!(terminal.reason, Some(TerminalReason::Operator));
    Ok(())
}

#[tokio::test]
async fn completion_is_derived_from_markers() -> TestResult {
    let ensemble = MemoryEnsemble::new();
    let s = store(&ensemble);
    let run = created_run(&s).await;

    for task in ["a", "b", "c"] {
        let task = TaskId::new(task);
        let state = s.read_run_state(&run).await?.expect("run exists");
        assert_eq!(state.status(), RunStatus::Running);

        assert_eq!(s.mark_task_started(&run, &task, 1).await?, ClaimOutcome::Granted);
        s.mark_task_completed(&run, &task, TaskResult::default()).await?;
    }

    let state = s.read_run_state(&run).await?.expect("run exists");
    assert!(state.terminal.is_none());
    assert!(state.all_completed());
    assert_eq!(state.status(), RunStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn archive_then_delete_hides_the_run() -> TestResult {
    let ensemble = MemoryEnsemble::new();
    let s = store(&ensemble);
    let run = created_run(&s).await;
    let task = TaskId::new("a");
    s.mark_task_started(&run, &task, 1).await?;
    s.record_task_failure(&run, &task, "x").await?;
    s.mark_run_force_failed(&run, TerminalReason::Operator).await?;

    let state = s.read_run_state(&run).await?.expect("run exists");
    assert!(s.archive_run(&state).await?);
    assert!(!s.archive_run(&state).await?);
    s.delete_active_run(&run).await?;

    assert!(s.read_run_state(&run).await?.is_none());
    assert!(!s.run_exists(&run).await?);
    assert!(s.list_active_run_ids().await?.is_empty());
    assert!(s.is_archived(&run).await?);

    let archived = s.read_archived_run(&run).await?.expect("archived");
    assert_eq!(archived.state, state);
    assert_eq!(archived.archived_by, s.instance_id());

    // An archived occurrence is never recreated.
    let again = s
        .try_create_run(&ScheduleId::new("chain"), 0, chain_snapshot())
        .await?;
    assert_eq!(again, CreateRunOutcome::AlreadyExists(run.clone()));
    assert!(!s.run_exists(&run).await?);
    Ok(())
}
