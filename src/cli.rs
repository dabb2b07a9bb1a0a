// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `flockdag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "flockdag",
    version,
    about = "Run scheduled task DAGs across a flock of leaderless workers.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `$FLOCKDAG_CONFIG`, else `Flockdag.toml` in the current
    /// working directory.
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Number of workers to run in this process. Each worker has its own
    /// coordination session and competes for work like a separate process.
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub workers: usize,

    /// Exit once every schedule has created all of its runs and every run is
    /// terminal.
    #[arg(long)]
    pub once: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `FLOCKDAG_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print schedules and DAGs, but don't execute anything.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
