pub mod builders;
pub mod flock;
pub mod hooked;
pub mod recording_executor;

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use flockdag::admin::RunReport;
use flockdag::coord::{Namespace, RetryPolicy};
use flockdag::engine::{SchedulerOptions, WorkflowEvent};
use flockdag::state::RunStateStore;
use flockdag::types::{RunId, RunStatus};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer() // print only for failing tests unless --nocapture
            .with_target(true)
            .init();
    });
}

/// Run a future with a 5-second timeout.
#[allow(dead_code)]
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: Future<Output = T>,
{
    with_timeout_secs(5, f).await
}

/// Run a future with a custom timeout.
pub async fn with_timeout_secs<F, T>(secs: u64, f: F) -> T
where
    F: Future<Output = T>,
{
    tokio::time::timeout(Duration::from_secs(secs), f)
        .await
        .unwrap_or_else(|_| panic!("Test timed out after {secs} seconds"))
}

/// Scheduler tunables that keep tests fast.
pub fn fast_options() -> SchedulerOptions {
    SchedulerOptions {
        poll_interval: Duration::from_millis(20),
        lock_timeout: Duration::from_millis(200),
        dispatch_pool_size: 10,
        max_concurrent_runs: 10,
        max_task_attempts: 3,
        namespace: Namespace::default(),
        retry: RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        },
    }
}

/// Poll `check` every 10ms until it returns true or `within` elapses.
pub async fn wait_until<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the report of `run_id` shows `status`, returning that report.
pub async fn wait_for_status(
    store: &RunStateStore,
    run_id: &RunId,
    status: RunStatus,
    within: Duration,
) -> RunReport {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let report = RunReport::load(store, run_id)
            .await
            .expect("loading run report");
        if report.status() == Some(status) {
            return report;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("run {run_id} did not reach {status} within {within:?}; last report: {report:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Receive events until one matches `pred`.
pub async fn next_event_matching<P>(
    rx: &mut broadcast::Receiver<WorkflowEvent>,
    within: Duration,
    mut pred: P,
) -> WorkflowEvent
where
    P: FnMut(&WorkflowEvent) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    };
    tokio::time::timeout(within, wait)
        .await
        .unwrap_or_else(|_| panic!("no matching event within {within:?}"))
}
