// src/errors.rs

//! Crate-wide error aliases and helpers.
//!
//! Everything in [`DagboxError`] is a *configuration* or *setup* problem:
//! it is reported before any task runs. Problems that happen while a task
//! executes are captured as typed task outcomes instead (see
//! [`crate::engine::FailureKind`]).

use std::path::PathBuf;

use thiserror::Error;

use crate::engine::TaskName;

#[derive(Error, Debug)]
pub enum DagboxError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("duplicate task '{0}'")]
    DuplicateTask(TaskName),

    #[error("task '{task}' has unknown dependency '{dependency}'")]
    UnknownDependency {
        task: TaskName,
        dependency: TaskName,
    },

    #[error("cycle detected in task graph: {}", .members.join(" -> "))]
    CycleDetected { members: Vec<TaskName> },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskName),

    #[error("task '{task}' declares input path {path:?} which does not exist")]
    InputPathMissing { task: TaskName, path: PathBuf },

    #[error("cache entry for fingerprint {fingerprint} already exists with different content")]
    CacheCorruption { fingerprint: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, DagboxError>;
