#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use dagbox::dag::{Task, TaskGraph};

/// Builder for [`Task`] to simplify test setup.
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            task: Task::new(name, command),
        }
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.task.dependencies.push(dep.to_string());
        self
    }

    pub fn input(mut self, path: &str) -> Self {
        self.task.input_paths.push(PathBuf::from(path));
        self
    }

    pub fn exclude(mut self, pattern: &str) -> Self {
        self.task.excluded_input_paths.push(pattern.to_string());
        self
    }

    pub fn output(mut self, path: &str) -> Self {
        self.task.output_paths.push(PathBuf::from(path));
        self
    }

    pub fn user(mut self, user: &str) -> Self {
        self.task.user = user.to_string();
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.task.environment.insert(key.to_string(), value.to_string());
        self
    }

    pub fn cache(mut self, enabled: bool) -> Self {
        self.task.cache = enabled;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.task.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

/// Build a validated graph, panicking on configuration errors.
pub fn graph(tasks: impl IntoIterator<Item = TaskBuilder>) -> TaskGraph {
    TaskGraph::from_tasks(tasks.into_iter().map(TaskBuilder::build))
        .expect("Failed to build valid graph from builders")
}
