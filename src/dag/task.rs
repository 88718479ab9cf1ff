// src/dag/task.rs

//! Task records as seen by the engine.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::TaskName;

/// Identity used inside the container when a task does not name one.
pub const DEFAULT_USER: &str = "root";

/// A named unit of work: a shell command plus the paths it reads and writes.
///
/// All paths are relative to the workspace root on the host and to the
/// configured container location inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub name: TaskName,
    pub description: Option<String>,
    /// Shell script text, run with `/bin/sh -c`.
    pub command: String,
    /// Direct dependencies, in declaration order.
    pub dependencies: Vec<TaskName>,
    pub input_paths: Vec<PathBuf>,
    /// Glob patterns (relative to the workspace) removed from the input set.
    pub excluded_input_paths: Vec<String>,
    pub output_paths: Vec<PathBuf>,
    pub user: String,
    pub environment: BTreeMap<String, String>,
    /// Whether results of this task may be read from / written to the cache.
    pub cache: bool,
    /// Per-task execution deadline; falls back to the run-level default.
    pub timeout: Option<Duration>,
}

impl Task {
    /// A task with the given name and command and every other field at its
    /// default.
    pub fn new(name: impl Into<TaskName>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            command: command.into(),
            dependencies: Vec::new(),
            input_paths: Vec::new(),
            excluded_input_paths: Vec::new(),
            output_paths: Vec::new(),
            user: DEFAULT_USER.to_string(),
            environment: BTreeMap::new(),
            cache: true,
            timeout: None,
        }
    }

    pub fn is_privileged(&self) -> bool {
        is_privileged_user(&self.user)
    }
}

/// Whether `user` (a name or `uid[:gid]`) is the container's root identity.
pub fn is_privileged_user(user: &str) -> bool {
    user == DEFAULT_USER || user == "0" || user.starts_with("0:")
}
