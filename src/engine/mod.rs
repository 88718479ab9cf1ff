// src/engine/mod.rs

//! Execution engine for dagbox.
//!
//! This module ties together:
//! - the pure scheduler from [`crate::dag`]
//! - fingerprinting and the shared cache store
//! - the container runtime, one container per executing task
//!
//! [`runtime`] owns the async session loop (a bounded `JoinSet` of workers);
//! [`worker`] runs a single task from cache claim to layer commit.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::dag::TaskStatus;
use crate::fingerprint::Fingerprint;

pub mod runtime;
pub mod worker;

pub use runtime::Session;

/// Canonical task name type used throughout the engine.
pub type TaskName = String;

/// Why a task ended `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The command exited with a non-zero status.
    NonZeroExit,
    /// The command exceeded its deadline and was killed.
    Timeout,
    /// A declared output was not produced.
    OutputMissing,
    /// A declared input vanished between pre-flight and fingerprinting.
    InputPathMissing,
    /// Container engine, host or cache trouble.
    Infrastructure,
    /// Another task with the same fingerprint ran in this session and failed.
    SharedFailure,
    /// The session was cancelled while the task was running.
    Cancelled,
}

impl FailureKind {
    pub fn label(self) -> &'static str {
        match self {
            FailureKind::NonZeroExit => "non-zero exit",
            FailureKind::Timeout => "timeout",
            FailureKind::OutputMissing => "output missing",
            FailureKind::InputPathMissing => "input missing",
            FailureKind::Infrastructure => "infrastructure",
            FailureKind::SharedFailure => "shared failure",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

/// Outcome record of one task in a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub name: TaskName,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub fingerprint: Option<Fingerprint>,
    pub failure: Option<FailureKind>,
    /// Human-readable detail for failures that are not plain exit codes.
    pub message: Option<String>,
}

impl TaskReport {
    pub fn new(name: impl Into<TaskName>, status: TaskStatus) -> Self {
        Self {
            name: name.into(),
            status,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
            fingerprint: None,
            failure: None,
            message: None,
        }
    }
}

/// Result of a whole session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    /// `true` when no task failed and the session was not cancelled.
    pub success: bool,
    pub cancelled: bool,
    /// One report per session task, in declaration order.
    pub reports: Vec<TaskReport>,
    pub failed: Vec<TaskName>,
    pub skipped: Vec<TaskName>,
}

impl SessionOutcome {
    pub fn report(&self, task: &str) -> Option<&TaskReport> {
        self.reports.iter().find(|r| r.name == task)
    }

    pub fn status_of(&self, task: &str) -> Option<TaskStatus> {
        self.report(task).map(|r| r.status)
    }
}

/// Run-level settings shared by every worker.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub image: String,
    /// Working directory inside containers.
    pub location: String,
    pub parallelism: usize,
    /// Deadline for tasks that do not declare their own.
    pub default_timeout: Option<Duration>,
    /// Image repository committed layers are tagged into.
    pub cache_repository: String,
    /// Tasks whose cache lookup is skipped.
    pub force: BTreeSet<TaskName>,
    pub force_all: bool,
}

impl SessionOptions {
    pub fn is_forced(&self, task: &str) -> bool {
        self.force_all || self.force.contains(task)
    }

    /// Tag prefix for layers committed for `fingerprint`. The runtime
    /// appends the committed image ID.
    pub fn layer_tag(&self, fingerprint: &Fingerprint) -> String {
        format!("{}:{}", self.cache_repository, fingerprint)
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            image: "ubuntu:24.04".to_string(),
            location: "/scratch".to_string(),
            parallelism: 1,
            default_timeout: None,
            cache_repository: "dagbox-cache".to_string(),
            force: BTreeSet::new(),
            force_all: false,
        }
    }
}
