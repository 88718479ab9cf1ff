// src/dag/graph.rs

use std::collections::{BTreeSet, HashMap};

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::dag::task::Task;
use crate::engine::TaskName;
use crate::errors::{DagboxError, Result};

/// Stable index of a task inside a [`TaskGraph`].
///
/// Indices are handed out in declaration order, so ordering by index is
/// ordering by declaration.
pub type TaskIndex = NodeIndex;

/// Arena-backed task graph.
///
/// Edge direction: dependency -> dependent. For
///
/// ```toml
/// [[task]]
/// name = "B"
/// dependencies = ["A"]
/// ```
///
/// we store the edge `A -> B`.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    graph: DiGraph<Task, ()>,
    index: HashMap<TaskName, TaskIndex>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single task whose dependencies have all been added already.
    ///
    /// Fails with [`DagboxError::DuplicateTask`] if the name is taken and
    /// [`DagboxError::UnknownDependency`] if a dependency is not (yet) part of
    /// the graph. A task naming itself is reported as a one-member cycle.
    pub fn add_task(&mut self, task: Task) -> Result<TaskIndex> {
        if self.index.contains_key(&task.name) {
            return Err(DagboxError::DuplicateTask(task.name));
        }

        for dep in &task.dependencies {
            if dep == &task.name {
                return Err(DagboxError::CycleDetected {
                    members: vec![task.name.clone()],
                });
            }
            if !self.index.contains_key(dep) {
                return Err(DagboxError::UnknownDependency {
                    task: task.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        let idx = self.insert_node(task);
        self.connect(idx);
        Ok(idx)
    }

    /// Build a graph from a batch of tasks in declaration order.
    ///
    /// Unlike [`TaskGraph::add_task`], dependencies may refer to tasks
    /// declared later in the batch. The finished graph is validated.
    pub fn from_tasks<I>(tasks: I) -> Result<Self>
    where
        I: IntoIterator<Item = Task>,
    {
        let mut graph = Self::new();
        let mut added = Vec::new();

        for task in tasks {
            if graph.index.contains_key(&task.name) {
                return Err(DagboxError::DuplicateTask(task.name));
            }
            added.push(graph.insert_node(task));
        }

        for &idx in &added {
            let task = &graph.graph[idx];
            for dep in &task.dependencies {
                if !graph.index.contains_key(dep) {
                    return Err(DagboxError::UnknownDependency {
                        task: task.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        for idx in added {
            graph.connect(idx);
        }

        graph.validate()?;
        Ok(graph)
    }

    /// Check that the graph is acyclic.
    ///
    /// On failure the error names every member of the first offending
    /// strongly connected component, in declaration order.
    pub fn validate(&self) -> Result<()> {
        let mut cycles: Vec<Vec<TaskIndex>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
            .map(|mut scc| {
                scc.sort();
                scc
            })
            .collect();

        if cycles.is_empty() {
            return Ok(());
        }

        cycles.sort();
        let members = cycles[0]
            .iter()
            .map(|&idx| self.graph[idx].name.clone())
            .collect();
        Err(DagboxError::CycleDetected { members })
    }

    /// All tasks in an order where every dependency precedes its dependents.
    ///
    /// Ties between independent tasks are broken by declaration order.
    pub fn topological_order(&self) -> Result<Vec<TaskIndex>> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|n| self.graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();

        let mut ready: BTreeSet<TaskIndex> = self
            .graph
            .node_indices()
            .filter(|n| in_degree[n.index()] == 0)
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(next) = ready.pop_first() {
            order.push(next);
            for dependent in self.graph.neighbors_directed(next, Direction::Outgoing) {
                let degree = &mut in_degree[dependent.index()];
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() != self.graph.node_count() {
            self.validate()?;
            return Err(DagboxError::ConfigError(
                "task graph could not be ordered".to_string(),
            ));
        }

        Ok(order)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn index_of(&self, name: &str) -> Option<TaskIndex> {
        self.index.get(name).copied()
    }

    pub fn task(&self, idx: TaskIndex) -> &Task {
        &self.graph[idx]
    }

    pub fn name_of(&self, idx: TaskIndex) -> &str {
        &self.graph[idx].name
    }

    /// Tasks in declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = (TaskIndex, &Task)> {
        self.graph
            .node_indices()
            .map(move |idx| (idx, &self.graph[idx]))
    }

    /// Direct dependencies of a task, in the order the task declares them.
    pub fn dependencies_of(&self, idx: TaskIndex) -> Vec<TaskIndex> {
        let mut deps: Vec<TaskIndex> = Vec::new();
        for name in &self.graph[idx].dependencies {
            if let Some(dep) = self.index_of(name) {
                if !deps.contains(&dep) {
                    deps.push(dep);
                }
            }
        }
        deps
    }

    /// Direct dependents of a task, in declaration order.
    pub fn dependents_of(&self, idx: TaskIndex) -> Vec<TaskIndex> {
        let mut dependents: Vec<TaskIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect();
        dependents.sort();
        dependents.dedup();
        dependents
    }

    /// Every task reachable upstream of `idx` (excluding `idx` itself).
    pub fn transitive_dependencies(&self, idx: TaskIndex) -> BTreeSet<TaskIndex> {
        let mut seen = BTreeSet::new();
        let mut stack = self.dependencies_of(idx);
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend(self.dependencies_of(next));
            }
        }
        seen
    }

    /// The given roots plus all of their transitive dependencies.
    pub fn closure(&self, roots: &[TaskIndex]) -> BTreeSet<TaskIndex> {
        let mut out = BTreeSet::new();
        for &root in roots {
            out.insert(root);
            out.extend(self.transitive_dependencies(root));
        }
        out
    }

    fn insert_node(&mut self, task: Task) -> TaskIndex {
        let name = task.name.clone();
        let idx = self.graph.add_node(task);
        self.index.insert(name, idx);
        idx
    }

    fn connect(&mut self, idx: TaskIndex) {
        // A self-reference becomes a loop edge, which `validate` reports.
        for dep in self.dependencies_of(idx) {
            self.graph.update_edge(dep, idx, ());
        }
    }
}
