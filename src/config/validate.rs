// src/config/validate.rs

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::config::model::{ConfigSection, RawTaskFile, RunSettings, TaskConfig, TaskFile};
use crate::dag::{Task, TaskGraph};
use crate::errors::{DagboxError, Result};
use crate::fingerprint::hash::exclude_set;
use crate::types::parse_duration;

static ENV_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"));

impl TryFrom<RawTaskFile> for TaskFile {
    type Error = DagboxError;

    fn try_from(raw: RawTaskFile) -> std::result::Result<Self, Self::Error> {
        ensure_has_tasks(&raw)?;
        let settings = validate_settings(&raw.config)?;

        let tasks = raw
            .task
            .into_iter()
            .map(|task| build_task(task, &raw.config.default_user))
            .collect::<Result<Vec<_>>>()?;
        let graph = TaskGraph::from_tasks(tasks)?;

        for name in &settings.default_tasks {
            if graph.index_of(name).is_none() {
                return Err(DagboxError::TaskNotFound(name.clone()));
            }
        }

        Ok(TaskFile { settings, graph })
    }
}

fn ensure_has_tasks(raw: &RawTaskFile) -> Result<()> {
    if raw.task.is_empty() {
        return Err(DagboxError::ConfigError(
            "task file must contain at least one [[task]] entry".to_string(),
        ));
    }
    Ok(())
}

fn validate_settings(cfg: &ConfigSection) -> Result<RunSettings> {
    if cfg.image.trim().is_empty() {
        return Err(DagboxError::ConfigError(
            "[config].image must not be empty".to_string(),
        ));
    }

    let parallelism = match cfg.parallelism {
        Some(0) => {
            return Err(DagboxError::ConfigError(
                "[config].parallelism must be >= 1 (got 0)".to_string(),
            ));
        }
        Some(n) => n,
        None => std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
    };

    if !cfg.location.starts_with('/') {
        return Err(DagboxError::ConfigError(format!(
            "[config].location must be an absolute container path (got {:?})",
            cfg.location
        )));
    }

    if cfg.default_user.trim().is_empty() {
        return Err(DagboxError::ConfigError(
            "[config].default_user must not be empty".to_string(),
        ));
    }

    if cfg.cache_repository.trim().is_empty() || cfg.cache_repository.contains(':') {
        return Err(DagboxError::ConfigError(format!(
            "[config].cache_repository must be a bare image repository (got {:?})",
            cfg.cache_repository
        )));
    }

    let timeout = cfg
        .timeout
        .as_deref()
        .map(|s| {
            parse_duration(s)
                .map_err(|e| DagboxError::ConfigError(format!("[config].timeout: {e}")))
        })
        .transpose()?;

    Ok(RunSettings {
        image: cfg.image.clone(),
        parallelism,
        timeout,
        location: cfg.location.clone(),
        cache_mode: cfg.cache_mode,
        cache_dir: cfg.cache_dir.clone(),
        cache_repository: cfg.cache_repository.clone(),
        read_cache: cfg.read_cache,
        write_cache: cfg.write_cache,
        default_tasks: cfg.default.clone(),
    })
}

fn build_task(cfg: TaskConfig, default_user: &str) -> Result<Task> {
    let name = cfg.name;
    if name.trim().is_empty() {
        return Err(DagboxError::ConfigError(
            "every [[task]] needs a non-empty name".to_string(),
        ));
    }
    if cfg.command.trim().is_empty() {
        return Err(DagboxError::ConfigError(format!(
            "task '{name}' has an empty command"
        )));
    }

    for path in cfg.input_paths.iter().chain(cfg.output_paths.iter()) {
        check_workspace_path(&name, path)?;
    }
    let input_paths = cfg.input_paths.iter().map(|p| normalize(p)).collect();
    let output_paths = cfg.output_paths.iter().map(|p| normalize(p)).collect();

    exclude_set(&cfg.excluded_input_paths)
        .map_err(|e| DagboxError::ConfigError(format!("task '{name}': {e:#}")))?;

    for key in cfg.environment.keys() {
        if !ENV_NAME.is_match(key) {
            return Err(DagboxError::ConfigError(format!(
                "task '{name}' has invalid environment variable name {key:?}"
            )));
        }
    }

    let user = cfg.user.unwrap_or_else(|| default_user.to_string());
    if user.trim().is_empty() {
        return Err(DagboxError::ConfigError(format!(
            "task '{name}' has an empty user"
        )));
    }

    let timeout = cfg
        .timeout
        .as_deref()
        .map(|s| {
            parse_duration(s)
                .map_err(|e| DagboxError::ConfigError(format!("task '{name}' timeout: {e}")))
        })
        .transpose()?;

    Ok(Task {
        description: cfg.description,
        command: cfg.command,
        dependencies: cfg.dependencies,
        input_paths,
        excluded_input_paths: cfg.excluded_input_paths,
        output_paths,
        user,
        environment: cfg.environment,
        cache: cfg.cache,
        timeout,
        name,
    })
}

/// Paths must stay inside the workspace: relative, non-empty, no `..`.
fn check_workspace_path(task: &str, path: &Path) -> Result<()> {
    let escapes = path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    let empty = !path
        .components()
        .any(|c| matches!(c, Component::Normal(_)));

    if escapes || empty {
        return Err(DagboxError::ConfigError(format!(
            "task '{task}' path {path:?} must be relative to the workspace and must not contain '..'"
        )));
    }
    Ok(())
}

/// Drop `.` components so `./out` and `out` name the same path everywhere.
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}
