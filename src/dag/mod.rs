// src/dag/mod.rs

//! Task graph representation and scheduling.
//!
//! - [`task`] is the validated task record.
//! - [`graph`] holds the arena-backed directed acyclic graph of tasks.
//! - [`scheduler`] contains the per-session state machine that decides
//!   which tasks are ready to run, and when dependents can be scheduled.
//! - [`task_info`] provides task states and the scheduled task type.
//! - [`scheduler_step`] defines the result type for scheduler steps.
//! - [`state_manager`] manages per-session state transitions.

pub mod graph;
pub mod scheduler;
pub mod scheduler_step;
pub mod state_manager;
pub mod task;
pub mod task_info;

pub use graph::{TaskGraph, TaskIndex};
pub use scheduler::{Completion, Scheduler};
pub use scheduler_step::SchedulerStep;
pub use task::Task;
pub use task_info::{ScheduledTask, TaskRunState, TaskStatus};
