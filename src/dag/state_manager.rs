// src/dag/state_manager.rs

//! Per-session state transitions for tasks in the scheduler.

use std::collections::BTreeSet;

use tracing::debug;

use crate::dag::graph::{TaskGraph, TaskIndex};
use crate::dag::task_info::TaskStatus;

/// Applies state transitions over the session's status table.
///
/// The table is indexed by [`TaskIndex::index`]; `None` means the task is not
/// part of the session.
pub struct StateManager<'a> {
    graph: &'a TaskGraph,
    states: &'a mut [Option<TaskStatus>],
}

impl<'a> StateManager<'a> {
    pub fn new(graph: &'a TaskGraph, states: &'a mut [Option<TaskStatus>]) -> Self {
        Self { graph, states }
    }

    /// Whether every dependency of `idx` ended `Succeeded` or
    /// `CachedSucceeded`.
    pub fn deps_satisfied(&self, idx: TaskIndex) -> bool {
        self.graph
            .dependencies_of(idx)
            .into_iter()
            .all(|dep| matches!(self.states[dep.index()], Some(s) if s.is_success()))
    }

    /// Move every `Pending` task whose dependencies are satisfied to `Ready`
    /// and add it to `ready`.
    ///
    /// Returns the newly ready tasks in declaration order.
    pub fn promote_ready(&mut self, ready: &mut BTreeSet<TaskIndex>) -> Vec<TaskIndex> {
        // Decide first, then mutate.
        let candidates: Vec<TaskIndex> = self
            .graph
            .tasks()
            .map(|(idx, _)| idx)
            .filter(|idx| matches!(self.states[idx.index()], Some(TaskStatus::Pending)))
            .filter(|idx| self.deps_satisfied(*idx))
            .collect();

        for &idx in &candidates {
            debug!(task = %self.graph.name_of(idx), "dependencies satisfied; marking Ready");
            self.states[idx.index()] = Some(TaskStatus::Ready);
            ready.insert(idx);
        }

        candidates
    }

    /// Mark every transitive dependent of `failed` that has not started as
    /// `Skipped`.
    ///
    /// Returns the newly skipped tasks (excluding `failed` itself).
    pub fn mark_dependents_skipped(
        &mut self,
        failed: TaskIndex,
        ready: &mut BTreeSet<TaskIndex>,
    ) -> Vec<TaskIndex> {
        let mut stack = self.graph.dependents_of(failed);
        let mut newly_skipped = Vec::new();

        while let Some(idx) = stack.pop() {
            match self.states[idx.index()] {
                Some(TaskStatus::Pending) | Some(TaskStatus::Ready) => {
                    debug!(
                        task = %self.graph.name_of(idx),
                        upstream = %self.graph.name_of(failed),
                        "marking dependent as Skipped due to upstream failure"
                    );
                    self.states[idx.index()] = Some(TaskStatus::Skipped);
                    ready.remove(&idx);
                    newly_skipped.push(idx);
                    stack.extend(self.graph.dependents_of(idx));
                }
                // Already terminal, running, or not part of this session.
                _ => {}
            }
        }

        newly_skipped.sort();
        newly_skipped
    }

    /// Skip everything that has not started yet.
    pub fn skip_all_waiting(&mut self, ready: &mut BTreeSet<TaskIndex>) -> Vec<TaskIndex> {
        let mut skipped = Vec::new();
        for (idx, state) in self.states.iter_mut().enumerate() {
            if matches!(state, Some(TaskStatus::Pending) | Some(TaskStatus::Ready)) {
                *state = Some(TaskStatus::Skipped);
                skipped.push(TaskIndex::new(idx));
            }
        }
        ready.clear();
        skipped
    }
}
