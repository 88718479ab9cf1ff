// src/dag/scheduler.rs

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::dag::graph::{TaskGraph, TaskIndex};
use crate::dag::scheduler_step::SchedulerStep;
use crate::dag::state_manager::StateManager;
use crate::dag::task_info::{ScheduledTask, TaskRunState, TaskStatus};
use crate::fingerprint::Fingerprint;

/// How a worker finished a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Succeeded {
        fingerprint: Fingerprint,
        cached: bool,
    },
    Failed,
}

/// Scheduler holds the immutable graph plus the mutable state of one session.
///
/// It is synchronous and performs no IO. It is responsible for:
/// - remembering which tasks are part of the session
/// - deciding when a task is ready (all dependencies succeeded)
/// - bounding the number of running tasks by `parallelism`
/// - recording fingerprints so dependents can be keyed
/// - skipping dependents when a task fails
#[derive(Debug)]
pub struct Scheduler {
    graph: Arc<TaskGraph>,
    /// Indexed by `TaskIndex::index()`; `None` = not in this session.
    states: Vec<Option<TaskStatus>>,
    fingerprints: Vec<Option<Fingerprint>>,
    /// Effective caching flag: `false` if the task or anything upstream has
    /// caching disabled.
    caching: Vec<bool>,
    ready: BTreeSet<TaskIndex>,
    running: usize,
    parallelism: usize,
}

impl Scheduler {
    /// Build a session for `selection` and all of its transitive
    /// dependencies.
    pub fn new(graph: Arc<TaskGraph>, selection: &[TaskIndex], parallelism: usize) -> Self {
        let mut states = vec![None; graph.len()];
        for idx in graph.closure(selection) {
            states[idx.index()] = Some(TaskStatus::Pending);
        }

        // Graphs reaching the scheduler are validated, so index order is a
        // fallback that never triggers in practice.
        let order = graph
            .topological_order()
            .unwrap_or_else(|_| graph.tasks().map(|(idx, _)| idx).collect());
        let mut caching = vec![true; graph.len()];
        for idx in order {
            let upstream_ok = graph
                .dependencies_of(idx)
                .into_iter()
                .all(|dep| caching[dep.index()]);
            caching[idx.index()] = graph.task(idx).cache && upstream_ok;
        }

        Self {
            fingerprints: vec![None; graph.len()],
            graph,
            states,
            caching,
            ready: BTreeSet::new(),
            running: 0,
            parallelism: parallelism.max(1),
        }
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Tasks participating in this session, in declaration order.
    pub fn session_tasks(&self) -> Vec<TaskIndex> {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| TaskIndex::new(i))
            .collect()
    }

    pub fn status(&self, idx: TaskIndex) -> Option<TaskStatus> {
        self.states.get(idx.index()).copied().flatten()
    }

    /// Read-only view of the named task's state.
    pub fn run_state_of(&self, task: &str) -> Option<TaskRunState> {
        let idx = self.graph.index_of(task)?;
        Some(self.status(idx).into())
    }

    pub fn fingerprint(&self, idx: TaskIndex) -> Option<Fingerprint> {
        self.fingerprints.get(idx.index()).copied().flatten()
    }

    pub fn running_count(&self) -> usize {
        self.running
    }

    /// Whether every task in the session reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.running == 0 && self.states.iter().flatten().all(|s| s.is_terminal())
    }

    /// Promote initially runnable tasks and dispatch up to `parallelism`.
    pub fn start(&mut self) -> SchedulerStep {
        info!(
            tasks = self.session_tasks().len(),
            parallelism = self.parallelism,
            "scheduler: starting session"
        );
        let graph = Arc::clone(&self.graph);
        StateManager::new(&graph, &mut self.states).promote_ready(&mut self.ready);
        self.step(Vec::new())
    }

    /// Record the outcome of a running task and return what to run next.
    pub fn complete(&mut self, idx: TaskIndex, completion: Completion) -> SchedulerStep {
        if self.status(idx) != Some(TaskStatus::Running) {
            warn!(
                task = %self.graph.name_of(idx),
                state = ?self.status(idx),
                "completion for a task that is not running; ignoring"
            );
            return self.step(Vec::new());
        }
        self.running -= 1;

        let graph = Arc::clone(&self.graph);
        let mut newly_skipped = Vec::new();

        match completion {
            Completion::Succeeded {
                fingerprint,
                cached,
            } => {
                let status = if cached {
                    TaskStatus::CachedSucceeded
                } else {
                    TaskStatus::Succeeded
                };
                debug!(task = %graph.name_of(idx), %fingerprint, ?status, "task completed");
                self.states[idx.index()] = Some(status);
                self.fingerprints[idx.index()] = Some(fingerprint);
                StateManager::new(&graph, &mut self.states).promote_ready(&mut self.ready);
            }
            Completion::Failed => {
                warn!(task = %graph.name_of(idx), "task failed; skipping its dependents");
                self.states[idx.index()] = Some(TaskStatus::Failed);
                newly_skipped = StateManager::new(&graph, &mut self.states)
                    .mark_dependents_skipped(idx, &mut self.ready);
            }
        }

        self.step(newly_skipped)
    }

    /// Skip every task that has not started.
    ///
    /// Running tasks are left alone; the caller is expected to stop them and
    /// report their completion.
    pub fn cancel(&mut self) -> Vec<TaskIndex> {
        let graph = Arc::clone(&self.graph);
        let skipped = StateManager::new(&graph, &mut self.states).skip_all_waiting(&mut self.ready);
        info!(
            skipped = skipped.len(),
            running = self.running,
            "scheduler: session cancelled"
        );
        skipped
    }

    fn step(&mut self, newly_skipped: Vec<TaskIndex>) -> SchedulerStep {
        let newly_scheduled = self.dispatch();
        SchedulerStep {
            newly_scheduled,
            newly_skipped,
            session_finished: self.is_finished(),
        }
    }

    /// Move ready tasks to `Running` in declaration order while capacity
    /// remains.
    fn dispatch(&mut self) -> Vec<ScheduledTask> {
        let mut scheduled = Vec::new();
        while self.running < self.parallelism {
            let Some(idx) = self.ready.pop_first() else {
                break;
            };
            self.states[idx.index()] = Some(TaskStatus::Running);
            self.running += 1;
            debug!(task = %self.graph.name_of(idx), running = self.running, "dispatching task");
            scheduled.push(self.scheduled_task(idx));
        }
        scheduled
    }

    fn scheduled_task(&self, idx: TaskIndex) -> ScheduledTask {
        let dependency_fingerprints = self
            .graph
            .dependencies_of(idx)
            .into_iter()
            .filter_map(|dep| self.fingerprints[dep.index()])
            .collect();

        let mut inherited_paths: Vec<PathBuf> = Vec::new();
        for dep in self.graph.transitive_dependencies(idx) {
            for path in &self.graph.task(dep).output_paths {
                if !inherited_paths.contains(path) {
                    inherited_paths.push(path.clone());
                }
            }
        }

        ScheduledTask {
            index: idx,
            task: self.graph.task(idx).clone(),
            dependency_fingerprints,
            inherited_paths,
            caching_enabled: self.caching[idx.index()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::task::Task;

    fn graph(edges: &[(&str, &[&str])]) -> Arc<TaskGraph> {
        let tasks = edges.iter().map(|(name, deps)| {
            let mut t = Task::new(*name, format!("echo {name}"));
            t.dependencies = deps.iter().map(|d| d.to_string()).collect();
            t
        });
        Arc::new(TaskGraph::from_tasks(tasks).unwrap())
    }

    fn fp(n: u8) -> Fingerprint {
        Fingerprint::from_bytes([n; 32])
    }

    fn names(graph: &TaskGraph, step: &SchedulerStep) -> Vec<String> {
        step.newly_scheduled
            .iter()
            .map(|t| graph.name_of(t.index).to_string())
            .collect()
    }

    #[test]
    fn chain_runs_in_dependency_order() {
        let g = graph(&[("A", &[]), ("B", &["A"])]);
        let mut s = Scheduler::new(Arc::clone(&g), &[g.index_of("B").unwrap()], 4);

        let step = s.start();
        assert_eq!(names(&g, &step), vec!["A"]);

        let a = g.index_of("A").unwrap();
        let step = s.complete(a, Completion::Succeeded { fingerprint: fp(1), cached: false });
        assert_eq!(names(&g, &step), vec!["B"]);
        assert_eq!(step.newly_scheduled[0].dependency_fingerprints, vec![fp(1)]);

        let b = g.index_of("B").unwrap();
        let step = s.complete(b, Completion::Succeeded { fingerprint: fp(2), cached: true });
        assert!(step.session_finished);
        assert_eq!(s.status(b), Some(TaskStatus::CachedSucceeded));
    }

    #[test]
    fn failure_skips_transitive_dependents_but_not_siblings() {
        let g = graph(&[("A", &[]), ("B", &["A"]), ("C", &["B"]), ("D", &[])]);
        let all: Vec<TaskIndex> = g.tasks().map(|(i, _)| i).collect();
        let mut s = Scheduler::new(Arc::clone(&g), &all, 4);

        let step = s.start();
        assert_eq!(names(&g, &step), vec!["A", "D"]);

        let step = s.complete(g.index_of("A").unwrap(), Completion::Failed);
        assert_eq!(
            step.newly_skipped,
            vec![g.index_of("B").unwrap(), g.index_of("C").unwrap()]
        );
        assert!(!step.session_finished);

        let step = s.complete(
            g.index_of("D").unwrap(),
            Completion::Succeeded { fingerprint: fp(4), cached: false },
        );
        assert!(step.session_finished);
        assert_eq!(s.run_state_of("C"), Some(TaskRunState::In(TaskStatus::Skipped)));
    }

    #[test]
    fn parallelism_bounds_dispatch_in_declaration_order() {
        let g = graph(&[("x", &[]), ("y", &[]), ("z", &[])]);
        let all: Vec<TaskIndex> = g.tasks().map(|(i, _)| i).collect();
        let mut s = Scheduler::new(Arc::clone(&g), &all, 1);

        assert_eq!(names(&g, &s.start()), vec!["x"]);
        let step = s.complete(all[0], Completion::Succeeded { fingerprint: fp(1), cached: false });
        assert_eq!(names(&g, &step), vec!["y"]);
        let step = s.complete(all[1], Completion::Succeeded { fingerprint: fp(2), cached: false });
        assert_eq!(names(&g, &step), vec!["z"]);
    }

    #[test]
    fn unselected_tasks_stay_out_of_the_session() {
        let g = graph(&[("A", &[]), ("B", &["A"]), ("other", &[])]);
        let s = Scheduler::new(Arc::clone(&g), &[g.index_of("B").unwrap()], 2);
        assert_eq!(s.run_state_of("other"), Some(TaskRunState::NotInSession));
        assert_eq!(s.run_state_of("A"), Some(TaskRunState::In(TaskStatus::Pending)));
        assert_eq!(s.run_state_of("missing"), None);
    }

    #[test]
    fn cache_opt_out_poisons_dependents() {
        let tasks = vec![
            {
                let mut t = Task::new("A", "date > stamp");
                t.cache = false;
                t
            },
            {
                let mut t = Task::new("B", "cat stamp");
                t.dependencies = vec!["A".into()];
                t
            },
            Task::new("C", "true"),
        ];
        let g = Arc::new(TaskGraph::from_tasks(tasks).unwrap());
        let all: Vec<TaskIndex> = g.tasks().map(|(i, _)| i).collect();
        let mut s = Scheduler::new(Arc::clone(&g), &all, 4);

        let step = s.start();
        let by_name = |n: &str| step.newly_scheduled.iter().find(|t| t.name() == n).cloned();
        assert!(!by_name("A").unwrap().caching_enabled);
        assert!(by_name("C").unwrap().caching_enabled);

        let step = s.complete(all[0], Completion::Succeeded { fingerprint: fp(1), cached: false });
        assert!(!step.newly_scheduled[0].caching_enabled);
    }

    #[test]
    fn cancel_skips_waiting_tasks() {
        let g = graph(&[("A", &[]), ("B", &["A"]), ("C", &[])]);
        let all: Vec<TaskIndex> = g.tasks().map(|(i, _)| i).collect();
        let mut s = Scheduler::new(Arc::clone(&g), &all, 1);
        s.start();

        let skipped = s.cancel();
        assert_eq!(skipped, vec![all[1], all[2]]);
        assert!(!s.is_finished());

        let step = s.complete(all[0], Completion::Failed);
        assert!(step.newly_scheduled.is_empty());
        assert!(step.session_finished);
    }
}
