// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::types::CacheMode;

/// Command-line arguments for `dagbox`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "dagbox",
    version,
    about = "Run a DAG of shell tasks in containers, skipping work whose inputs have not changed.",
    long_about = None
)]
pub struct CliArgs {
    /// Tasks to run, together with their dependencies.
    ///
    /// Default: `[config].default`, or every task when that is empty.
    #[arg(value_name = "TASK")]
    pub tasks: Vec<String>,

    /// Path to the task file (TOML).
    #[arg(long, short = 'f', value_name = "PATH", default_value = "dagbox.toml")]
    pub file: PathBuf,

    /// Workspace root. Defaults to the directory containing the task file.
    #[arg(long, value_name = "DIR")]
    pub workspace: Option<PathBuf>,

    /// Maximum number of tasks running at once. Overrides `[config].parallelism`.
    #[arg(long, short = 'j', value_name = "N")]
    pub jobs: Option<usize>,

    /// Ignore cached results for this task (repeatable). Results are still stored.
    #[arg(long, value_name = "TASK")]
    pub force: Vec<String>,

    /// Ignore cached results for every task.
    #[arg(long)]
    pub force_all: bool,

    #[arg(long)]
    pub no_read_cache: bool,

    #[arg(long)]
    pub no_write_cache: bool,

    /// Override `[config].cache_mode`.
    #[arg(long, value_enum, value_name = "MODE")]
    pub cache_mode: Option<CacheMode>,

    /// List tasks and exit.
    #[arg(long)]
    pub list: bool,

    /// Parse + validate, print the execution plan, but don't run anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Open an interactive shell in the cached layer of this task (or the
    /// base image when it has none).
    #[arg(long, value_name = "TASK")]
    pub shell: Option<String>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `DAGBOX_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_selection_and_flags() {
        let args = CliArgs::try_parse_from([
            "dagbox", "build", "test", "-j", "2", "--force", "build", "--force", "lint",
            "--cache-mode", "memory", "--no-write-cache",
        ])
        .unwrap();

        assert_eq!(args.tasks, vec!["build", "test"]);
        assert_eq!(args.jobs, Some(2));
        assert_eq!(args.force, vec!["build", "lint"]);
        assert_eq!(args.cache_mode, Some(CacheMode::Memory));
        assert!(args.no_write_cache);
        assert!(!args.no_read_cache);
        assert_eq!(args.file, PathBuf::from("dagbox.toml"));
    }
}
