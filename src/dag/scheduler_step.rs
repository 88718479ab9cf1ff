// src/dag/scheduler_step.rs

//! Step-by-step result type for the scheduler.

use crate::dag::graph::TaskIndex;
use crate::dag::task_info::ScheduledTask;

/// Structured result of a single scheduler "step".
///
/// Tests use this to drive the DAG by hand and assert on what changed.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStep {
    /// Tasks handed to workers as a result of this step.
    pub newly_scheduled: Vec<ScheduledTask>,
    /// Tasks newly marked `Skipped` in this step.
    pub newly_skipped: Vec<TaskIndex>,
    /// Whether every task in the session is now terminal.
    pub session_finished: bool,
}
