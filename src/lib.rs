// src/lib.rs

pub mod admin;
pub mod cli;
pub mod config;
pub mod coord;
pub mod dag;
pub mod definitions;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod state;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::admin::AllRunReports;
use crate::cli::CliArgs;
use crate::config::{default_config_path, load_and_validate, ConfigFile, FileDefinitions};
use crate::coord::{MemoryEnsemble, SharedCoordinator};
use crate::definitions::{DefinitionSource, Definitions};
use crate::engine::{EventBus, SchedulerOptions, WorkflowEvent, WorkflowManager};
use crate::exec::{SharedExecutor, ShellExecutor};
use crate::state::RunStateStore;

/// High-level entry point used by `main.rs`.
///
/// Local mode: this wires together
/// - config loading
/// - one in-memory coordination ensemble shared by `--workers` workers
/// - the shell executor
/// - Ctrl-C handling
/// - a final report on stdout
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = args
        .config
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);
    let cfg = load_and_validate(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    if args.dry_run {
        print_dry_run(&cfg);
        return Ok(());
    }

    if args.workers == 0 {
        bail!("--workers must be >= 1");
    }

    let options = SchedulerOptions::from(&cfg.config);
    let definitions: Arc<dyn DefinitionSource> = Arc::new(FileDefinitions::new(&config_path));
    let executor: SharedExecutor = Arc::new(ShellExecutor::new());
    let ensemble = MemoryEnsemble::new();
    let events = EventBus::default();

    if args.once && has_unbounded_schedule(&cfg.definitions()) {
        warn!("--once with a schedule that repeats forever; run until Ctrl-C");
    }

    spawn_event_logger(&events);

    let managers: Vec<WorkflowManager> = (0..args.workers)
        .map(|_| {
            let coord: SharedCoordinator = Arc::new(ensemble.connect());
            WorkflowManager::start_with_events(
                coord,
                options.clone(),
                Arc::clone(&definitions),
                Arc::clone(&executor),
                events.clone(),
            )
        })
        .collect();
    info!(workers = managers.len(), "workers started");

    let admin = RunStateStore::new(
        Arc::new(ensemble.connect()),
        options.namespace.clone(),
        options.retry,
    );

    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!(error = %e, "failed to listen for Ctrl+C");
                } else {
                    info!("Ctrl+C received; shutting down");
                }
                break;
            }
            _ = tokio::time::sleep(options.poll_interval) => {}
        }

        if managers.iter().all(WorkflowManager::is_finished) {
            warn!("all workers stopped");
            break;
        }
        if args.once && work_done(&admin, definitions.as_ref()).await? {
            info!("all schedules exhausted and all runs terminal");
            break;
        }
    }

    for manager in managers {
        if let Err(e) = manager.shutdown().await {
            warn!(error = %e, "worker stopped with an error");
        }
    }

    let reports = AllRunReports::load(&admin).await?;
    println!("runs ({}):", reports.len());
    for report in reports.reports() {
        println!("  {report}");
    }

    Ok(())
}

fn spawn_event_logger(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(WorkflowEvent::RunStarted { run_id, schedule_id, occurrence }) => {
                    info!(run_id = %run_id, schedule = %schedule_id, occurrence, "run started");
                }
                Ok(WorkflowEvent::RunCompleted { run_id }) => {
                    info!(run_id = %run_id, "run completed");
                }
                Ok(WorkflowEvent::RunCanceled { run_id, reason }) => {
                    info!(run_id = %run_id, ?reason, "run canceled");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event logger lagged behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn has_unbounded_schedule(definitions: &Definitions) -> bool {
    definitions
        .schedules
        .values()
        .any(|s| s.repetition.count.is_none())
}

/// Every schedule has created all of its occurrences and every active run
/// is terminal.
async fn work_done(store: &RunStateStore, definitions: &dyn DefinitionSource) -> Result<bool> {
    let definitions = definitions.load()?;
    for schedule in definitions.schedules.values() {
        let Some(count) = schedule.repetition.count else {
            return Ok(false);
        };
        if (store.occurrences(&schedule.id).await?.len() as u32) < count {
            return Ok(false);
        }
    }
    Ok(AllRunReports::load(store).await?.all_terminal())
}

/// Simple dry-run output: print tunables, schedules, DAGs and tasks.
fn print_dry_run(cfg: &ConfigFile) {
    let c = &cfg.config;
    println!("flockdag dry-run");
    println!("  config.poll_interval_ms = {}", c.poll_interval_ms);
    println!("  config.lock_timeout_ms = {}", c.lock_timeout_ms);
    println!("  config.dispatch_pool_size = {}", c.dispatch_pool_size);
    println!("  config.max_concurrent_runs = {}", c.max_concurrent_runs);
    println!("  config.max_task_attempts = {}", c.max_task_attempts);
    println!("  config.namespace = {}", c.namespace);
    println!();

    println!("schedules ({}):", cfg.schedule.len());
    for (name, schedule) in cfg.schedule.iter() {
        let repeat = match schedule.repeat {
            0 => "forever".to_string(),
            n => format!("{n}x"),
        };
        println!(
            "  - {name}: dag {} {repeat} every {}ms",
            schedule.dag, schedule.interval_ms
        );
    }
    println!();

    println!("dags ({}):", cfg.dag.len());
    for (name, dag) in cfg.dag.iter() {
        println!("  - {name}");
        for (task, node) in dag.task.iter() {
            if node.after.is_empty() {
                println!("      {task}");
            } else {
                println!("      {task} after {:?}", node.after);
            }
        }
    }
    println!();

    println!("tasks ({}):", cfg.task.len());
    for (name, task) in cfg.task.iter() {
        println!("  - {name}");
        if let Some(ref cmd) = task.cmd {
            println!("      cmd: {cmd}");
        }
        if !task.payload.is_empty() {
            println!("      payload: {:?}", task.payload);
        }
    }
}
