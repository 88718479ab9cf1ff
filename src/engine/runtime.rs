// src/engine/runtime.rs

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cache::CacheStore;
use crate::container::ContainerRuntime;
use crate::dag::{
    Completion, Scheduler, SchedulerStep, Task, TaskGraph, TaskIndex, TaskStatus,
};
use crate::engine::worker::{self, WorkerContext, WorkerResult};
use crate::engine::{FailureKind, SessionOptions, SessionOutcome, TaskName, TaskReport};
use crate::errors::{DagboxError, Result};
use crate::fingerprint::FingerprintEngine;
use crate::fs::FileSystem;

/// One invocation: a task selection over a validated graph plus the
/// collaborators the workers need.
///
/// [`Session::new`] performs every check that can fail before anything runs;
/// [`Session::run`] then drives the pure [`Scheduler`] with a bounded pool of
/// workers and always produces a [`SessionOutcome`].
pub struct Session {
    graph: Arc<TaskGraph>,
    selection: Vec<TaskIndex>,
    ctx: WorkerContext,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("tasks", &self.graph.len())
            .field("selection", &self.selection)
            .field("options", &self.ctx.options)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Resolve `selection` (empty = every task) and run the pre-flight input
    /// check over the selected tasks and their dependencies.
    pub fn new(
        graph: Arc<TaskGraph>,
        selection: &[TaskName],
        runtime: Arc<dyn ContainerRuntime>,
        cache: Arc<CacheStore>,
        fingerprints: Arc<FingerprintEngine>,
        options: SessionOptions,
    ) -> Result<Self> {
        let selection: Vec<TaskIndex> = if selection.is_empty() {
            graph.tasks().map(|(idx, _)| idx).collect()
        } else {
            selection
                .iter()
                .map(|name| {
                    graph
                        .index_of(name)
                        .ok_or_else(|| DagboxError::TaskNotFound(name.clone()))
                })
                .collect::<Result<_>>()?
        };

        preflight(
            &graph,
            &selection,
            fingerprints.filesystem(),
            fingerprints.workspace(),
        )?;

        Ok(Self {
            graph,
            selection,
            ctx: WorkerContext {
                runtime,
                cache,
                fingerprints,
                options: Arc::new(options),
            },
        })
    }

    /// The session's tasks (selection plus dependencies) in a valid
    /// execution order.
    pub fn plan(&self) -> Result<Vec<&Task>> {
        let closure = self.graph.closure(&self.selection);
        Ok(self
            .graph
            .topological_order()?
            .into_iter()
            .filter(|idx| closure.contains(idx))
            .map(|idx| self.graph.task(idx))
            .collect())
    }

    /// Run the session until every selected task is terminal.
    ///
    /// Flipping `cancel` to `true` skips everything that has not started and
    /// stops the running workers, which destroy their containers and report
    /// `Failed` (cancelled).
    pub async fn run(self, mut cancel: watch::Receiver<bool>) -> SessionOutcome {
        let mut scheduler = Scheduler::new(
            Arc::clone(&self.graph),
            &self.selection,
            self.ctx.options.parallelism,
        );
        let mut reports: HashMap<TaskIndex, TaskReport> = HashMap::new();
        let mut workers: JoinSet<WorkerResult> = JoinSet::new();
        let mut worker_tasks: HashMap<tokio::task::Id, TaskIndex> = HashMap::new();
        let mut was_cancelled = *cancel.borrow();

        info!("session started");
        if was_cancelled {
            self.skip(scheduler.cancel(), &mut reports);
        }
        let step = scheduler.start();
        self.apply_step(step, &mut workers, &mut worker_tasks, &mut reports, &cancel);

        while !scheduler.is_finished() {
            tokio::select! {
                _ = worker::cancelled(&mut cancel), if !was_cancelled => {
                    warn!("cancellation requested; skipping tasks that have not started");
                    was_cancelled = true;
                    self.skip(scheduler.cancel(), &mut reports);
                }
                joined = workers.join_next_with_id() => {
                    let (index, completion, report) = match joined {
                        Some(Ok((id, result))) => {
                            worker_tasks.remove(&id);
                            (result.index, result.completion, result.report)
                        }
                        Some(Err(join_err)) => {
                            let Some(index) = worker_tasks.remove(&join_err.id()) else {
                                error!(error = %join_err, "unknown worker failed");
                                continue;
                            };
                            error!(
                                task = %self.graph.name_of(index),
                                infrastructure = true,
                                error = %join_err,
                                "worker panicked"
                            );
                            let mut report =
                                TaskReport::new(self.graph.name_of(index), TaskStatus::Failed);
                            report.failure = Some(FailureKind::Infrastructure);
                            report.message = Some(format!("worker panicked: {join_err}"));
                            (index, Completion::Failed, report)
                        }
                        None => {
                            error!("no running workers but session is not finished");
                            break;
                        }
                    };

                    reports.insert(index, report);
                    let step = scheduler.complete(index, completion);
                    self.apply_step(step, &mut workers, &mut worker_tasks, &mut reports, &cancel);
                }
            }
        }

        self.finish(&scheduler, reports, was_cancelled)
    }

    fn apply_step(
        &self,
        step: SchedulerStep,
        workers: &mut JoinSet<WorkerResult>,
        worker_tasks: &mut HashMap<tokio::task::Id, TaskIndex>,
        reports: &mut HashMap<TaskIndex, TaskReport>,
        cancel: &watch::Receiver<bool>,
    ) {
        self.skip(step.newly_skipped, reports);

        for task in step.newly_scheduled {
            let index = task.index;
            debug!(task = %task.name(), "spawning worker");
            let handle = workers.spawn(worker::run_task(self.ctx.clone(), task, cancel.clone()));
            worker_tasks.insert(handle.id(), index);
        }
    }

    fn skip(&self, skipped: Vec<TaskIndex>, reports: &mut HashMap<TaskIndex, TaskReport>) {
        for index in skipped {
            info!(task = %self.graph.name_of(index), "task skipped");
            reports.insert(
                index,
                TaskReport::new(self.graph.name_of(index), TaskStatus::Skipped),
            );
        }
    }

    fn finish(
        &self,
        scheduler: &Scheduler,
        mut reports: HashMap<TaskIndex, TaskReport>,
        cancelled: bool,
    ) -> SessionOutcome {
        let mut outcome = SessionOutcome {
            success: false,
            cancelled,
            reports: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
        };

        for index in scheduler.session_tasks() {
            let name = self.graph.name_of(index);
            let report = reports
                .remove(&index)
                .unwrap_or_else(|| TaskReport::new(name, TaskStatus::Skipped));
            match report.status {
                TaskStatus::Failed => outcome.failed.push(report.name.clone()),
                TaskStatus::Skipped => outcome.skipped.push(report.name.clone()),
                _ => {}
            }
            outcome.reports.push(report);
        }

        outcome.success = outcome.failed.is_empty() && !cancelled;
        info!(
            success = outcome.success,
            failed = outcome.failed.len(),
            skipped = outcome.skipped.len(),
            "session finished"
        );
        outcome
    }
}

/// Every declared input of every session task must exist in the workspace or
/// be produced by one of the task's transitive dependencies.
fn preflight(
    graph: &TaskGraph,
    selection: &[TaskIndex],
    fs: &dyn FileSystem,
    workspace: &Path,
) -> Result<()> {
    for index in graph.closure(selection) {
        let task = graph.task(index);
        let upstream = graph.transitive_dependencies(index);

        for input in &task.input_paths {
            if fs.exists(&workspace.join(input)) {
                continue;
            }
            let produced = upstream.iter().any(|&dep| {
                graph
                    .task(dep)
                    .output_paths
                    .iter()
                    .any(|out| input.starts_with(out) || out.starts_with(input))
            });
            if !produced {
                return Err(DagboxError::InputPathMissing {
                    task: task.name.clone(),
                    path: input.clone(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;
    use std::path::PathBuf;

    fn graph(tasks: Vec<Task>) -> TaskGraph {
        TaskGraph::from_tasks(tasks).unwrap()
    }

    #[test]
    fn preflight_accepts_inputs_produced_upstream() {
        let mut a = Task::new("A", "echo hi > out.txt");
        a.output_paths = vec![PathBuf::from("out.txt")];
        let mut b = Task::new("B", "cat out.txt");
        b.dependencies = vec!["A".into()];
        b.input_paths = vec![PathBuf::from("out.txt"), PathBuf::from("src")];
        let g = graph(vec![a, b]);

        let fs = MockFileSystem::new();
        fs.add_file("/ws/src/main.c", "x");
        let all: Vec<TaskIndex> = g.tasks().map(|(i, _)| i).collect();
        preflight(&g, &all, &fs, Path::new("/ws")).unwrap();
    }

    #[test]
    fn preflight_rejects_missing_inputs() {
        let mut a = Task::new("A", "true");
        a.input_paths = vec![PathBuf::from("missing.txt")];
        let g = graph(vec![a]);

        let fs = MockFileSystem::new();
        let all: Vec<TaskIndex> = g.tasks().map(|(i, _)| i).collect();
        let err = preflight(&g, &all, &fs, Path::new("/ws")).unwrap_err();
        assert!(matches!(
            err,
            DagboxError::InputPathMissing { task, path }
                if task == "A" && path == PathBuf::from("missing.txt")
        ));
    }

    #[test]
    fn preflight_ignores_unrelated_producers() {
        let mut a = Task::new("A", "echo hi > out.txt");
        a.output_paths = vec![PathBuf::from("out.txt")];
        let mut b = Task::new("B", "cat out.txt");
        b.input_paths = vec![PathBuf::from("out.txt")];
        let g = graph(vec![a, b]);

        let fs = MockFileSystem::new();
        let all: Vec<TaskIndex> = g.tasks().map(|(i, _)| i).collect();
        assert!(preflight(&g, &all, &fs, Path::new("/ws")).is_err());
    }
}
