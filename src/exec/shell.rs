// src/exec/shell.rs

//! Shell-command executor.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::exec::{CancelSignal, ExecutableTask, TaskExecutor, TaskOutcome};
use crate::state::TaskResult;

/// Runs each task's `cmd` with `sh -c` (`cmd /C` on Windows).
///
/// The run id, task id, attempt number and payload entries are exported as
/// `FLOCKDAG_*` environment variables. The last line written to stdout
/// becomes the result message. Tasks without a command succeed immediately.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl TaskExecutor for ShellExecutor {
    fn execute(
        &self,
        task: ExecutableTask,
        cancel: CancelSignal,
    ) -> Pin<Box<dyn Future<Output = TaskOutcome> + Send + '_>> {
        Box::pin(async move {
            let run_id = task.run_id.clone();
            let task_id = task.task_id.clone();
            match run_command(task, cancel).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(run_id = %run_id, task = %task_id, error = %err, "task execution error");
                    TaskOutcome::Failed(format!("{err:#}"))
                }
            }
        })
    }
}

async fn run_command(task: ExecutableTask, mut cancel: CancelSignal) -> Result<TaskOutcome> {
    let Some(cmd_line) = task.definition.cmd.as_deref() else {
        debug!(run_id = %task.run_id, task = %task.task_id, "task has no command; nothing to run");
        return Ok(TaskOutcome::Success(TaskResult::default()));
    };

    info!(
        run_id = %task.run_id,
        task = %task.task_id,
        attempt = task.attempt,
        cmd = %cmd_line,
        "starting task process"
    );

    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(cmd_line);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(cmd_line);
        c
    };

    cmd.env("FLOCKDAG_RUN_ID", task.run_id.as_str())
        .env("FLOCKDAG_TASK_ID", task.task_id.as_str())
        .env("FLOCKDAG_ATTEMPT", task.attempt.to_string());
    for (key, value) in task.definition.payload.iter() {
        cmd.env(payload_env_name(key), value);
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning process for task '{}'", task.task_id))?;

    // Always consume stderr so buffers don't fill; log at debug.
    if let Some(stderr) = child.stderr.take() {
        let task_id = task.task_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(task = %task_id, "stderr: {}", line);
            }
        });
    }

    let stdout_reader = child.stdout.take().map(|stdout| {
        let task_id = task.task_id.clone();
        tokio::spawn(async move {
            let mut last = String::new();
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(task = %task_id, "stdout: {}", line);
                if !line.trim().is_empty() {
                    last = line;
                }
            }
            last
        })
    });

    tokio::select! {
        status_res = child.wait() => {
            let status = status_res.with_context(|| {
                format!("waiting for process of task '{}'", task.task_id)
            })?;
            let code = status.code().unwrap_or(-1);

            info!(
                run_id = %task.run_id,
                task = %task.task_id,
                exit_code = code,
                success = status.success(),
                "task process exited"
            );

            let message = match stdout_reader {
                Some(handle) => handle.await.unwrap_or_default(),
                None => String::new(),
            };

            if status.success() {
                let mut result = TaskResult::with_message(message);
                result.data.insert("exit_code".to_string(), code.to_string());
                Ok(TaskOutcome::Success(result))
            } else {
                Ok(TaskOutcome::Failed(format!("exit code {code}")))
            }
        }

        _ = cancel.cancelled() => {
            info!(
                run_id = %task.run_id,
                task = %task.task_id,
                "cancellation requested for running task; killing process"
            );
            if let Err(e) = child.kill().await {
                warn!(
                    run_id = %task.run_id,
                    task = %task.task_id,
                    error = %e,
                    "failed to kill child process on cancellation"
                );
            }
            Ok(TaskOutcome::Cancelled)
        }
    }
}

/// `owner` becomes `FLOCKDAG_PAYLOAD_OWNER`.
fn payload_env_name(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("FLOCKDAG_PAYLOAD_{sanitized}")
}
