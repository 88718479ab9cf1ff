use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dagbox::container::{
    BoxFuture, ContainerError, ContainerId, ContainerRuntime, ExecOutput, ExecRequest, LayerRef,
};
use globset::GlobSet;

/// What a scripted command does when executed.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Files the command leaves behind, relative to the working directory.
    pub writes: Vec<(PathBuf, String)>,
    pub delay: Duration,
}

impl Script {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }

    pub fn writes(mut self, path: &str, contents: &str) -> Self {
        self.writes.push((PathBuf::from(path), contents.to_string()));
        self
    }

    pub fn stdout(mut self, text: &str) -> Self {
        self.stdout = text.to_string();
        self
    }

    pub fn stderr(mut self, text: &str) -> Self {
        self.stderr = text.to_string();
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Everything the fake runtime was asked to do, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Created(ContainerId),
    Materialized {
        container: ContainerId,
        paths: Vec<PathBuf>,
    },
    ExecStarted {
        container: ContainerId,
        command: String,
        user: String,
    },
    ExecFinished {
        container: ContainerId,
        command: String,
    },
    TimedOut {
        container: ContainerId,
        command: String,
    },
    Extracted {
        container: ContainerId,
        paths: Vec<PathBuf>,
    },
    Committed(String),
    Destroyed(ContainerId),
}

#[derive(Default)]
struct Inner {
    scripts: HashMap<String, Script>,
    /// Per container: files produced by commands, keyed by relative path.
    containers: HashMap<ContainerId, BTreeMap<PathBuf, String>>,
    /// Image IDs of committed layers.
    layers: BTreeSet<String>,
    next_id: u64,
    next_image: u64,
    create_delay: Duration,
    created: usize,
    destroyed: usize,
    running: usize,
    max_running: usize,
    fail_create: bool,
    events: Vec<Event>,
}

/// A scripted in-memory [`ContainerRuntime`].
///
/// - commands are looked up in the script table (unknown commands succeed
///   silently)
/// - files a script writes appear on the host only when extracted
/// - committed layers are remembered until removed
#[derive(Clone, Default)]
pub struct FakeRuntime {
    inner: Arc<Mutex<Inner>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn script(&self, command: &str, script: Script) -> &Self {
        self.lock().scripts.insert(command.to_string(), script);
        self
    }

    pub fn fail_create(&self, fail: bool) {
        self.lock().fail_create = fail;
    }

    /// Container creation completes on the engine side immediately but the
    /// call only returns after `delay`.
    pub fn create_delay(&self, delay: Duration) {
        self.lock().create_delay = delay;
    }

    pub fn remove_layer(&self, layer: &LayerRef) -> bool {
        self.lock().layers.remove(layer.image())
    }

    pub fn layers(&self) -> Vec<String> {
        self.lock().layers.iter().cloned().collect()
    }

    pub fn created(&self) -> usize {
        self.lock().created
    }

    pub fn destroyed(&self) -> usize {
        self.lock().destroyed
    }

    pub fn live_containers(&self) -> usize {
        self.lock().containers.len()
    }

    /// Highest number of commands that were executing at the same time.
    pub fn max_concurrency(&self) -> usize {
        self.lock().max_running
    }

    pub fn events(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    /// Commands in the order they started.
    pub fn executed(&self) -> Vec<String> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                Event::ExecStarted { command, .. } => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    /// Paths copied into the container that ran `command`.
    pub fn inputs_of(&self, command: &str) -> Option<Vec<PathBuf>> {
        let events = self.events();
        let container = events.iter().find_map(|e| match e {
            Event::ExecStarted {
                container,
                command: c,
                ..
            } if c == command => Some(container.clone()),
            _ => None,
        })?;
        events.into_iter().find_map(|e| match e {
            Event::Materialized { container: c, paths } if c == container => Some(paths),
            _ => None,
        })
    }
}

/// Decrements the running count even when the exec future is dropped.
struct Running(Arc<Mutex<Inner>>);

impl Drop for Running {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.0.lock() {
            inner.running -= 1;
        }
    }
}

impl ContainerRuntime for FakeRuntime {
    fn create_container<'a>(
        &'a self,
        image: &'a str,
    ) -> BoxFuture<'a, Result<ContainerId, ContainerError>> {
        Box::pin(async move {
            let (id, delay) = {
                let mut inner = self.lock();
                if inner.fail_create {
                    return Err(ContainerError::CreateFailed {
                        image: image.to_string(),
                        reason: "scripted failure".to_string(),
                    });
                }
                inner.next_id += 1;
                let id = ContainerId::new(format!("fake-{}", inner.next_id));
                inner.created += 1;
                inner.containers.insert(id.clone(), BTreeMap::new());
                inner.events.push(Event::Created(id.clone()));
                (id, inner.create_delay)
            };
            tokio::time::sleep(delay).await;
            Ok(id)
        })
    }

    fn materialize_inputs<'a>(
        &'a self,
        id: &'a ContainerId,
        workspace: &'a Path,
        paths: &'a [PathBuf],
        _excluded: &'a GlobSet,
    ) -> BoxFuture<'a, Result<(), ContainerError>> {
        Box::pin(async move {
            for path in paths {
                if std::fs::symlink_metadata(workspace.join(path)).is_err() {
                    return Err(ContainerError::InputCopyFailed {
                        path: path.clone(),
                        reason: "not found on host".to_string(),
                    });
                }
            }
            self.lock().events.push(Event::Materialized {
                container: id.clone(),
                paths: paths.to_vec(),
            });
            Ok(())
        })
    }

    fn exec_as<'a>(
        &'a self,
        id: &'a ContainerId,
        request: &'a ExecRequest,
    ) -> BoxFuture<'a, Result<ExecOutput, ContainerError>> {
        Box::pin(async move {
            let script = {
                let mut inner = self.lock();
                inner.events.push(Event::ExecStarted {
                    container: id.clone(),
                    command: request.command.clone(),
                    user: request.user.clone(),
                });
                inner.running += 1;
                inner.max_running = inner.max_running.max(inner.running);
                inner
                    .scripts
                    .get(&request.command)
                    .cloned()
                    .unwrap_or_default()
            };
            let running = Running(Arc::clone(&self.inner));

            let work = tokio::time::sleep(script.delay);
            let finished = match request.timeout {
                Some(timeout) => tokio::time::timeout(timeout, work).await.is_ok(),
                None => {
                    work.await;
                    true
                }
            };
            drop(running);

            let mut inner = self.lock();
            if !finished {
                inner.events.push(Event::TimedOut {
                    container: id.clone(),
                    command: request.command.clone(),
                });
                return Err(ContainerError::ExecutionTimeout {
                    timeout: request.timeout.unwrap_or_default(),
                });
            }

            if let Some(files) = inner.containers.get_mut(id) {
                for (path, contents) in &script.writes {
                    files.insert(path.clone(), contents.clone());
                }
            }
            inner.events.push(Event::ExecFinished {
                container: id.clone(),
                command: request.command.clone(),
            });

            Ok(ExecOutput {
                exit_code: script.exit_code,
                stdout: script.stdout,
                stderr: script.stderr,
            })
        })
    }

    fn extract_outputs<'a>(
        &'a self,
        id: &'a ContainerId,
        workspace: &'a Path,
        paths: &'a [PathBuf],
    ) -> BoxFuture<'a, Result<(), ContainerError>> {
        Box::pin(async move {
            let files = self
                .lock()
                .containers
                .get(id)
                .cloned()
                .ok_or_else(|| ContainerError::Engine(format!("no such container {id}")))?;

            let mut produced = Vec::new();
            for path in paths {
                let under: Vec<_> = files
                    .iter()
                    .filter(|(file, _)| file.starts_with(path))
                    .collect();
                if under.is_empty() {
                    return Err(ContainerError::OutputMissing { path: path.clone() });
                }
                produced.push((path, under));
            }

            for (path, under) in produced {
                let host = workspace.join(path);
                if host.is_dir() {
                    let _ = std::fs::remove_dir_all(&host);
                } else {
                    let _ = std::fs::remove_file(&host);
                }
                for (file, contents) in under {
                    let dest = workspace.join(file);
                    if let Some(parent) = dest.parent() {
                        std::fs::create_dir_all(parent)
                            .map_err(|e| ContainerError::Engine(e.to_string()))?;
                    }
                    std::fs::write(&dest, contents)
                        .map_err(|e| ContainerError::Engine(e.to_string()))?;
                }
            }

            self.lock().events.push(Event::Extracted {
                container: id.clone(),
                paths: paths.to_vec(),
            });
            Ok(())
        })
    }

    fn commit_layer<'a>(
        &'a self,
        _id: &'a ContainerId,
        tag_prefix: &'a str,
    ) -> BoxFuture<'a, Result<LayerRef, ContainerError>> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner.next_image += 1;
            let image = format!("sha256:{:012x}", inner.next_image);
            let tag = format!("{tag_prefix}-{:012x}", inner.next_image);
            inner.layers.insert(image.clone());
            inner.events.push(Event::Committed(tag.clone()));
            Ok(LayerRef::new(image, tag))
        })
    }

    fn layer_exists<'a>(
        &'a self,
        layer: &'a LayerRef,
    ) -> BoxFuture<'a, Result<bool, ContainerError>> {
        Box::pin(async move { Ok(self.lock().layers.contains(layer.image())) })
    }

    fn destroy<'a>(&'a self, id: &'a ContainerId) -> BoxFuture<'a, Result<(), ContainerError>> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner.containers.remove(id);
            inner.destroyed += 1;
            inner.events.push(Event::Destroyed(id.clone()));
            Ok(())
        })
    }
}
