// src/container/docker.rs

//! [`ContainerRuntime`] backed by the `docker` command-line client.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use globset::GlobSet;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::container::staging::{copy_tree, replace_path};
use crate::container::{
    BoxFuture, ContainerError, ContainerId, ContainerRuntime, ExecOutput, ExecRequest, LayerRef,
};
use crate::dag::task::is_privileged_user;

/// Drives containers through the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    binary: String,
    location: String,
    scratch_dir: Option<PathBuf>,
}

impl DockerRuntime {
    /// `location` is the working directory inside every container.
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            binary: "docker".to_string(),
            location: location.into(),
            scratch_dir: None,
        }
    }

    /// Use a different client binary (e.g. `podman`).
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Directory that extracted outputs pass through before they are moved
    /// into the workspace. Defaults to `<workspace>/.dagbox/tmp`.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    fn scratch_root(&self, workspace: &Path) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| workspace.join(".dagbox").join("tmp"))
    }

    fn container_path(&self, rel: &Path) -> String {
        format!("{}/{}", self.location.trim_end_matches('/'), rel.display())
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run a client command and return its stdout, or its stderr on failure.
    async fn run(&self, args: &[&str]) -> Result<String, String> {
        debug!(binary = %self.binary, ?args, "running container client");
        let output = self
            .command(args)
            .output()
            .await
            .map_err(|e| format!("unable to run {}: {e}", self.binary))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }

    async fn start(&self, id: &ContainerId) -> Result<(), ContainerError> {
        self.run(&["container", "start", id.as_str()])
            .await
            .map(|_| ())
            .map_err(ContainerError::Engine)
    }

    async fn kill(&self, id: &ContainerId) {
        if let Err(e) = self.run(&["container", "kill", id.as_str()]).await {
            warn!(container = %id, error = %e, "failed to kill timed out container");
        }
    }

    /// Hand the working location to `user` so an unprivileged command can
    /// write its outputs.
    async fn grant_location(&self, id: &ContainerId, user: &str) -> Result<(), ContainerError> {
        self.run(&[
            "container",
            "exec",
            "--user",
            "root",
            id.as_str(),
            "chown",
            "-R",
            user,
            self.location.as_str(),
        ])
        .await
        .map(|_| ())
        .map_err(|e| ContainerError::Engine(format!("unable to chown {}: {e}", self.location)))
    }

    /// Start an interactive shell in `image` with stdio attached to the
    /// terminal. Used by `--shell`.
    pub async fn spawn_shell(&self, image: &str, user: &str) -> Result<(), ContainerError> {
        info!(image, user, "spawning interactive shell");
        let status = Command::new(&self.binary)
            .args([
                "container",
                "run",
                "--rm",
                "--interactive",
                "--tty",
                "--init",
                "--user",
                user,
                "--workdir",
                self.location.as_str(),
                image,
                "/bin/sh",
            ])
            .status()
            .await
            .map_err(|e| ContainerError::Engine(format!("unable to run {}: {e}", self.binary)))?;

        if status.success() {
            Ok(())
        } else {
            Err(ContainerError::Engine(format!(
                "the shell exited with status {}",
                status.code().unwrap_or(-1)
            )))
        }
    }
}

impl ContainerRuntime for DockerRuntime {
    fn create_container<'a>(
        &'a self,
        image: &'a str,
    ) -> BoxFuture<'a, Result<ContainerId, ContainerError>> {
        Box::pin(async move {
            // `--interactive` keeps `/bin/sh` alive on an open stdin once
            // started.
            let out = self
                .run(&[
                    "container",
                    "create",
                    "--init",
                    "--interactive",
                    "--workdir",
                    self.location.as_str(),
                    image,
                    "/bin/sh",
                ])
                .await
                .map_err(|reason| ContainerError::CreateFailed {
                    image: image.to_string(),
                    reason,
                })?;
            Ok(ContainerId::new(out.trim()))
        })
    }

    fn materialize_inputs<'a>(
        &'a self,
        id: &'a ContainerId,
        workspace: &'a Path,
        paths: &'a [PathBuf],
        excluded: &'a GlobSet,
    ) -> BoxFuture<'a, Result<(), ContainerError>> {
        Box::pin(async move {
            if paths.is_empty() {
                return Ok(());
            }

            let staging = tempfile::Builder::new()
                .prefix("dagbox-inputs")
                .tempdir()
                .map_err(|e| ContainerError::Engine(format!("unable to create staging dir: {e}")))?;

            let root = staging.path().to_path_buf();
            let workspace_owned = workspace.to_path_buf();
            let paths_owned = paths.to_vec();
            let excluded_owned = excluded.clone();
            tokio::task::spawn_blocking(move || {
                for rel in &paths_owned {
                    copy_tree(&workspace_owned, rel, &root, &excluded_owned).map_err(|e| {
                        ContainerError::InputCopyFailed {
                            path: rel.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                }
                Ok::<_, ContainerError>(())
            })
            .await
            .map_err(|e| ContainerError::Engine(format!("staging task failed: {e}")))??;

            let source = format!("{}/.", staging.path().display());
            let target = format!("{}:{}", id, self.location);
            self.run(&["container", "cp", source.as_str(), target.as_str()])
                .await
                .map_err(|reason| ContainerError::InputCopyFailed {
                    path: staging.path().to_path_buf(),
                    reason,
                })?;

            debug!(container = %id, inputs = paths.len(), "inputs copied into container");
            Ok(())
        })
    }

    fn exec_as<'a>(
        &'a self,
        id: &'a ContainerId,
        request: &'a ExecRequest,
    ) -> BoxFuture<'a, Result<ExecOutput, ContainerError>> {
        Box::pin(async move {
            self.start(id).await?;
            if !is_privileged_user(&request.user) {
                self.grant_location(id, &request.user).await?;
            }

            let mut args: Vec<String> = vec![
                "container".into(),
                "exec".into(),
                "--user".into(),
                request.user.clone(),
                "--workdir".into(),
                request.location.clone(),
            ];
            for (key, value) in &request.environment {
                args.push("--env".into());
                args.push(format!("{key}={value}"));
            }
            args.push(id.to_string());
            args.extend(["/bin/sh".into(), "-c".into(), request.command.clone()]);

            let mut cmd = Command::new(&self.binary);
            cmd.args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let output = match request.timeout {
                Some(limit) => match tokio::time::timeout(limit, cmd.output()).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(container = %id, timeout = ?limit, "command timed out; killing container");
                        self.kill(id).await;
                        return Err(ContainerError::ExecutionTimeout { timeout: limit });
                    }
                },
                None => cmd.output().await,
            }
            .map_err(|e| ContainerError::Engine(format!("unable to run {}: {e}", self.binary)))?;

            Ok(ExecOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
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
            if paths.is_empty() {
                return Ok(());
            }

            // `docker cp` into an existing directory nests the copy inside
            // it, so everything lands in a fresh directory first.
            let root = self.scratch_root(workspace);
            std::fs::create_dir_all(&root)
                .map_err(|e| ContainerError::Engine(format!("unable to create {root:?}: {e}")))?;
            let scratch = tempfile::Builder::new()
                .prefix("outputs")
                .tempdir_in(&root)
                .map_err(|e| ContainerError::Engine(format!("unable to create scratch dir: {e}")))?;

            let mut fetched = Vec::with_capacity(paths.len());
            for (n, rel) in paths.iter().enumerate() {
                let intermediate = scratch.path().join(n.to_string());
                let source = format!("{}:{}", id, self.container_path(rel));
                let dest = intermediate.display().to_string();
                if let Err(reason) = self.run(&["container", "cp", source.as_str(), dest.as_str()]).await {
                    if reason.contains("No such") || reason.contains("Could not find") {
                        return Err(ContainerError::OutputMissing { path: rel.clone() });
                    }
                    return Err(ContainerError::Engine(reason));
                }
                fetched.push((intermediate, rel));
            }

            for (intermediate, rel) in fetched {
                replace_path(&intermediate, &workspace.join(rel)).map_err(|e| {
                    ContainerError::Engine(format!("unable to place output {:?}: {e}", rel))
                })?;
            }

            debug!(container = %id, outputs = paths.len(), "outputs extracted");
            Ok(())
        })
    }

    fn commit_layer<'a>(
        &'a self,
        id: &'a ContainerId,
        tag_prefix: &'a str,
    ) -> BoxFuture<'a, Result<LayerRef, ContainerError>> {
        Box::pin(async move {
            let out = self
                .run(&["container", "commit", id.as_str()])
                .await
                .map_err(|e| ContainerError::Engine(format!("unable to commit {id}: {e}")))?;
            let image = out.trim();
            if image.is_empty() {
                return Err(ContainerError::Engine(format!(
                    "commit of {id} printed no image id"
                )));
            }

            let tag = unique_tag(tag_prefix, image);
            self.run(&["image", "tag", image, tag.as_str()])
                .await
                .map_err(|e| ContainerError::Engine(format!("unable to tag {image}: {e}")))?;
            info!(container = %id, image, layer = %tag, "committed layer");
            Ok(LayerRef::new(image, tag))
        })
    }

    fn layer_exists<'a>(
        &'a self,
        layer: &'a LayerRef,
    ) -> BoxFuture<'a, Result<bool, ContainerError>> {
        Box::pin(async move {
            let status = self
                .command(&["image", "inspect", layer.image()])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .map_err(|e| ContainerError::Engine(format!("unable to run {}: {e}", self.binary)))?;
            Ok(status.success())
        })
    }

    fn destroy<'a>(&'a self, id: &'a ContainerId) -> BoxFuture<'a, Result<(), ContainerError>> {
        Box::pin(async move {
            self.run(&["container", "rm", "--force", id.as_str()])
                .await
                .map(|_| ())
                .map_err(ContainerError::Engine)
        })
    }
}

/// `<prefix>-<first 12 hex digits of the image id>`.
fn unique_tag(prefix: &str, image: &str) -> String {
    let digest = image.strip_prefix("sha256:").unwrap_or(image);
    let short: String = digest.chars().take(12).collect();
    format!("{prefix}-{short}")
}
