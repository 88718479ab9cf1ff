// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::dag::TaskGraph;
use crate::engine::TaskName;
use crate::types::CacheMode;

/// Task file as read from TOML, before validation.
///
/// ```toml
/// [config]
/// image = "ubuntu:24.04"
/// parallelism = 4
///
/// [[task]]
/// name = "build"
/// command = "make"
/// input_paths = ["src", "Makefile"]
/// output_paths = ["out"]
/// ```
///
/// Tasks are an array so declaration order is preserved and duplicate names
/// survive parsing long enough to be reported.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawTaskFile {
    /// Run-level settings from `[config]`.
    #[serde(default)]
    pub config: ConfigSection,

    /// All tasks from `[[task]]`, in declaration order.
    #[serde(default)]
    pub task: Vec<TaskConfig>,
}

/// `[config]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigSection {
    /// Base image every task container starts from.
    #[serde(default = "default_image")]
    pub image: String,

    /// Maximum number of tasks running at once. Defaults to the number of
    /// available CPUs.
    #[serde(default)]
    pub parallelism: Option<usize>,

    /// Default per-task deadline, e.g. `"10m"`.
    #[serde(default)]
    pub timeout: Option<String>,

    /// Working directory inside containers.
    #[serde(default = "default_location")]
    pub location: String,

    /// User for tasks that do not name one.
    #[serde(default = "default_user")]
    pub default_user: String,

    #[serde(default)]
    pub cache_mode: CacheMode,

    /// Relative paths are resolved against the workspace.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Image repository committed layers are tagged into.
    #[serde(default = "default_cache_repository")]
    pub cache_repository: String,

    #[serde(default = "default_true")]
    pub read_cache: bool,

    #[serde(default = "default_true")]
    pub write_cache: bool,

    /// Tasks run when none are named on the command line. Empty = all.
    #[serde(default)]
    pub default: Vec<TaskName>,
}

fn default_image() -> String {
    "ubuntu:24.04".to_string()
}

fn default_location() -> String {
    "/scratch".to_string()
}

fn default_user() -> String {
    crate::dag::task::DEFAULT_USER.to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".dagbox/cache")
}

fn default_cache_repository() -> String {
    "dagbox-cache".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ConfigSection {
    fn default() -> Self {
        Self {
            image: default_image(),
            parallelism: None,
            timeout: None,
            location: default_location(),
            default_user: default_user(),
            cache_mode: CacheMode::default(),
            cache_dir: default_cache_dir(),
            cache_repository: default_cache_repository(),
            read_cache: true,
            write_cache: true,
            default: Vec::new(),
        }
    }
}

/// `[[task]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    pub name: TaskName,

    #[serde(default)]
    pub description: Option<String>,

    /// Shell script text.
    pub command: String,

    #[serde(default)]
    pub dependencies: Vec<TaskName>,

    #[serde(default)]
    pub input_paths: Vec<PathBuf>,

    /// Glob patterns removed from the input set.
    #[serde(default)]
    pub excluded_input_paths: Vec<String>,

    #[serde(default)]
    pub output_paths: Vec<PathBuf>,

    /// Falls back to `[config].default_user`.
    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    #[serde(default = "default_true")]
    pub cache: bool,

    /// Overrides `[config].timeout`.
    #[serde(default)]
    pub timeout: Option<String>,
}

/// Validated run-level settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub image: String,
    pub parallelism: usize,
    pub timeout: Option<Duration>,
    pub location: String,
    pub cache_mode: CacheMode,
    pub cache_dir: PathBuf,
    pub cache_repository: String,
    pub read_cache: bool,
    pub write_cache: bool,
    pub default_tasks: Vec<TaskName>,
}

/// A validated task file: settings plus an acyclic task graph.
///
/// Only obtainable through `TryFrom<RawTaskFile>`.
#[derive(Debug, Clone)]
pub struct TaskFile {
    pub settings: RunSettings,
    pub graph: TaskGraph,
}
