// src/dag/task_info.rs

//! Per-session task state and the unit of work handed to workers.

use std::path::PathBuf;

use crate::dag::graph::TaskIndex;
use crate::dag::task::Task;
use crate::fingerprint::Fingerprint;

/// Lifecycle of a task inside one session.
///
/// `Pending -> Ready -> Running -> {Succeeded, Failed, CachedSucceeded}`,
/// with `Skipped` reachable from `Pending` / `Ready` when an upstream task
/// fails or the session is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Waiting for at least one dependency.
    Pending,
    /// All dependencies succeeded; waiting for a free worker.
    Ready,
    /// Handed to a worker.
    Running,
    Succeeded,
    /// Satisfied from the cache without touching the container runtime.
    CachedSucceeded,
    Failed,
    /// Never executed because an upstream task failed or the session was
    /// cancelled.
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded
                | TaskStatus::CachedSucceeded
                | TaskStatus::Failed
                | TaskStatus::Skipped
        )
    }

    /// Whether dependents may treat this task as satisfied.
    pub fn is_success(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::CachedSucceeded)
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::CachedSucceeded => "cached",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

/// Public, read-only view of a task's state in the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRunState {
    /// The task was not selected (directly or as a dependency).
    NotInSession,
    In(TaskStatus),
}

impl From<Option<TaskStatus>> for TaskRunState {
    fn from(state: Option<TaskStatus>) -> Self {
        match state {
            None => TaskRunState::NotInSession,
            Some(status) => TaskRunState::In(status),
        }
    }
}

/// Description of a task that the scheduler wants a worker to run now.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub index: TaskIndex,
    pub task: Task,
    /// Fingerprints of the direct dependencies, in declared order.
    pub dependency_fingerprints: Vec<Fingerprint>,
    /// Declared outputs of every transitive dependency. These are copied into
    /// the container next to the task's own inputs.
    pub inherited_paths: Vec<PathBuf>,
    /// `false` when this task or anything upstream has `cache = false`.
    pub caching_enabled: bool,
}

impl ScheduledTask {
    pub fn name(&self) -> &str {
        &self.task.name
    }
}
