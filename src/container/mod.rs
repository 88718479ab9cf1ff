// src/container/mod.rs

//! Container runtime abstraction.
//!
//! The engine talks to a [`ContainerRuntime`] instead of a concrete engine.
//! Production uses [`docker::DockerRuntime`]; tests provide a scripted fake
//! that never touches a real container engine.
//!
//! - [`docker`] drives the `docker` CLI through `tokio::process`.
//! - [`staging`] builds host-side copies of input trees before they are
//!   copied into a container.

pub mod docker;
pub mod staging;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use globset::GlobSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub use docker::DockerRuntime;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opaque handle of a created container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A committed layer: the image ID the engine assigned to the snapshot and
/// the tag it was published under.
///
/// The ID is what identifies the layer. Tags are unique per commit, so
/// committing the same fingerprint again never moves an existing entry's tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerRef {
    image: String,
    tag: String,
}

impl LayerRef {
    pub fn new(image: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            tag: tag.into(),
        }
    }

    /// Content-addressed image ID, e.g. `sha256:...`.
    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl fmt::Display for LayerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag)
    }
}

/// A command to run inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    /// Shell script text, run with `/bin/sh -c`.
    pub command: String,
    pub user: String,
    pub environment: BTreeMap<String, String>,
    /// Working directory inside the container.
    pub location: String,
    pub timeout: Option<Duration>,
}

/// Exit status and captured streams of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContainerError {
    #[error("unable to create container from image '{image}': {reason}")]
    CreateFailed { image: String, reason: String },

    #[error("unable to copy input {path:?} into the container: {reason}")]
    InputCopyFailed { path: PathBuf, reason: String },

    #[error("command did not finish within {timeout:?}")]
    ExecutionTimeout { timeout: Duration },

    #[error("declared output {path:?} was not produced")]
    OutputMissing { path: PathBuf },

    #[error("container engine error: {0}")]
    Engine(String),
}

impl ContainerError {
    /// Problems with the container engine or the host, as opposed to the
    /// task's own command misbehaving.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            ContainerError::CreateFailed { .. }
                | ContainerError::InputCopyFailed { .. }
                | ContainerError::Engine(_)
        )
    }
}

/// Trait abstracting the container engine.
///
/// Every method is fallible with a typed [`ContainerError`]. Implementations
/// must be cheap to share behind an `Arc`.
pub trait ContainerRuntime: Send + Sync {
    /// Create a stopped container from `image` whose working directory is
    /// the configured location.
    fn create_container<'a>(&'a self, image: &'a str)
    -> BoxFuture<'a, Result<ContainerId, ContainerError>>;

    /// Copy `paths` (relative to `workspace`) into the container at
    /// `<location>/<path>`, leaving out entries matched by `excluded`.
    fn materialize_inputs<'a>(
        &'a self,
        id: &'a ContainerId,
        workspace: &'a Path,
        paths: &'a [PathBuf],
        excluded: &'a GlobSet,
    ) -> BoxFuture<'a, Result<(), ContainerError>>;

    /// Run `request.command` as `request.user`.
    ///
    /// A non-zero exit is a successful call with a non-zero
    /// [`ExecOutput::exit_code`]; only the deadline and engine problems are
    /// errors.
    fn exec_as<'a>(
        &'a self,
        id: &'a ContainerId,
        request: &'a ExecRequest,
    ) -> BoxFuture<'a, Result<ExecOutput, ContainerError>>;

    /// Copy `paths` from `<location>/<path>` back to `workspace/<path>`,
    /// replacing whatever is there. Nothing is written unless every path was
    /// produced.
    fn extract_outputs<'a>(
        &'a self,
        id: &'a ContainerId,
        workspace: &'a Path,
        paths: &'a [PathBuf],
    ) -> BoxFuture<'a, Result<(), ContainerError>>;

    /// Snapshot the container into a new image and tag it
    /// `<tag_prefix>-<short image id>`.
    fn commit_layer<'a>(
        &'a self,
        id: &'a ContainerId,
        tag_prefix: &'a str,
    ) -> BoxFuture<'a, Result<LayerRef, ContainerError>>;

    /// Whether a previously committed layer is still present.
    fn layer_exists<'a>(&'a self, layer: &'a LayerRef)
    -> BoxFuture<'a, Result<bool, ContainerError>>;

    fn destroy<'a>(&'a self, id: &'a ContainerId) -> BoxFuture<'a, Result<(), ContainerError>>;
}

/// Owns one container for the duration of a task.
///
/// Call [`ContainerGuard::release`] on every path out of the worker. If the
/// guard is dropped without being released (a panic, or an aborted future),
/// destruction is spawned onto the current tokio runtime.
pub struct ContainerGuard {
    runtime: Arc<dyn ContainerRuntime>,
    id: ContainerId,
    armed: bool,
}

impl ContainerGuard {
    pub async fn create(
        runtime: Arc<dyn ContainerRuntime>,
        image: &str,
    ) -> Result<Self, ContainerError> {
        let id = runtime.create_container(image).await?;
        debug!(container = %id, image, "container created");
        Ok(Self {
            runtime,
            id,
            armed: true,
        })
    }

    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    pub async fn release(mut self) {
        self.armed = false;
        match self.runtime.destroy(&self.id).await {
            Ok(()) => debug!(container = %self.id, "container destroyed"),
            Err(e) => warn!(container = %self.id, error = %e, "failed to destroy container"),
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let runtime = Arc::clone(&self.runtime);
        let id = self.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(container = %id, "container guard dropped; destroying in background");
                handle.spawn(async move {
                    if let Err(e) = runtime.destroy(&id).await {
                        warn!(container = %id, error = %e, "failed to destroy container");
                    }
                });
            }
            Err(_) => warn!(container = %id, "no async runtime to destroy leaked container"),
        }
    }
}
