// src/lib.rs

pub mod cache;
pub mod cli;
pub mod config;
pub mod container;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod fingerprint;
pub mod fs;
pub mod logging;
pub mod report;
pub mod types;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::cli::CliArgs;
use crate::config::{RunSettings, TaskFile, load_and_validate};
use crate::container::docker::DockerRuntime;
use crate::container::{ContainerRuntime, LayerRef};
use crate::dag::{Task, TaskGraph};
use crate::engine::{Session, SessionOptions};
use crate::errors::DagboxError;
use crate::fingerprint::{Fingerprint, FingerprintEngine};
use crate::fs::RealFileSystem;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - task-file loading
/// - cache store, fingerprint engine and Docker runtime
/// - the session
/// - Ctrl-C handling
///
/// Returns whether the session succeeded.
pub async fn run(args: CliArgs) -> Result<bool> {
    let TaskFile { settings, graph } = load_and_validate(&args.file)
        .with_context(|| format!("failed to load task file {}", args.file.display()))?;
    let workspace = workspace_root(&args)?;
    debug!(workspace = %workspace.display(), "resolved workspace");

    if args.list {
        print_task_list(&graph);
        return Ok(true);
    }

    let graph = Arc::new(graph);
    let fingerprints = Arc::new(FingerprintEngine::new(
        Arc::new(RealFileSystem),
        &workspace,
        settings.image.as_str(),
        settings.location.as_str(),
    ));
    let cache_dir = cache_dir(&settings, &workspace);
    let cache = Arc::new(open_cache(&args, &settings, &cache_dir));
    let docker = Arc::new(
        DockerRuntime::new(settings.location.as_str()).with_scratch_dir(cache_dir.join("tmp")),
    );

    if let Some(task) = &args.shell {
        open_shell(&graph, task, &settings, &fingerprints, &cache, &docker).await?;
        return Ok(true);
    }

    let options = session_options(&args, &settings, &graph)?;
    let selection = if args.tasks.is_empty() {
        settings.default_tasks.clone()
    } else {
        args.tasks.clone()
    };

    let session = Session::new(
        Arc::clone(&graph),
        &selection,
        docker,
        cache,
        fingerprints,
        options,
    )?;

    if args.dry_run {
        print_dry_run(&session, &settings)?;
        return Ok(true);
    }

    // Ctrl-C -> cancel the session.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            return;
        }
        let _ = cancel_tx.send(true);
    });

    let outcome = session.run(cancel_rx).await;
    print!("{}", report::render_session(&outcome));
    Ok(outcome.success)
}

/// `--workspace`, or the directory containing the task file.
fn workspace_root(args: &CliArgs) -> Result<PathBuf> {
    let root = match &args.workspace {
        Some(dir) => dir.clone(),
        None => match args.file.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        },
    };
    std::path::absolute(&root)
        .with_context(|| format!("failed to resolve workspace {}", root.display()))
}

/// Relative cache directories live under the workspace.
fn cache_dir(settings: &RunSettings, workspace: &Path) -> PathBuf {
    if settings.cache_dir.is_absolute() {
        settings.cache_dir.clone()
    } else {
        workspace.join(&settings.cache_dir)
    }
}

fn open_cache(args: &CliArgs, settings: &RunSettings, dir: &Path) -> CacheStore {
    let mode = args.cache_mode.unwrap_or(settings.cache_mode);

    CacheStore::open(mode, dir)
        .with_read(settings.read_cache && !args.no_read_cache)
        .with_write(settings.write_cache && !args.no_write_cache)
}

fn session_options(
    args: &CliArgs,
    settings: &RunSettings,
    graph: &TaskGraph,
) -> Result<SessionOptions> {
    let parallelism = args.jobs.unwrap_or(settings.parallelism);
    if parallelism == 0 {
        bail!("--jobs must be >= 1");
    }

    let force: BTreeSet<String> = args.force.iter().cloned().collect();
    for name in &force {
        if graph.index_of(name).is_none() {
            return Err(DagboxError::TaskNotFound(name.clone()).into());
        }
    }

    Ok(SessionOptions {
        image: settings.image.clone(),
        location: settings.location.clone(),
        parallelism,
        default_timeout: settings.timeout,
        cache_repository: settings.cache_repository.clone(),
        force,
        force_all: args.force_all,
    })
}

/// Open a shell in the committed layer of `task`, falling back to the base
/// image when the task has no usable cache entry.
async fn open_shell(
    graph: &TaskGraph,
    task: &str,
    settings: &RunSettings,
    fingerprints: &FingerprintEngine,
    cache: &CacheStore,
    docker: &DockerRuntime,
) -> Result<()> {
    let index = graph
        .index_of(task)
        .ok_or_else(|| DagboxError::TaskNotFound(task.to_string()))?;

    let image = match cached_layer(graph, index, fingerprints, cache, docker).await {
        Ok(Some(layer)) => {
            info!(task, layer = %layer, "opening shell in cached layer");
            layer.image().to_string()
        }
        Ok(None) => {
            info!(task, "no cached layer; opening shell in base image");
            settings.image.clone()
        }
        Err(e) => {
            warn!(task, error = %e, "cannot fingerprint task; opening shell in base image");
            settings.image.clone()
        }
    };

    docker
        .spawn_shell(&image, &graph.task(index).user)
        .await
        .context("interactive shell failed")
}

async fn cached_layer(
    graph: &TaskGraph,
    target: dag::TaskIndex,
    fingerprints: &FingerprintEngine,
    cache: &CacheStore,
    docker: &DockerRuntime,
) -> Result<Option<LayerRef>> {
    let closure = graph.closure(&[target]);
    let mut computed = std::collections::HashMap::new();

    for index in graph.topological_order()? {
        if !closure.contains(&index) {
            continue;
        }
        let deps: Vec<Fingerprint> = graph
            .dependencies_of(index)
            .iter()
            .filter_map(|dep| computed.get(dep).copied())
            .collect();
        let fp = fingerprints.fingerprint(graph.task(index), &deps)?;
        computed.insert(index, fp);
    }

    let Some(fp) = computed.get(&target) else {
        return Ok(None);
    };
    let Some(layer) = cache.lookup(fp)?.and_then(|entry| entry.layer) else {
        return Ok(None);
    };
    if docker.layer_exists(&layer).await? {
        Ok(Some(layer))
    } else {
        Ok(None)
    }
}

fn print_task_list(graph: &TaskGraph) {
    for (_, task) in graph.tasks() {
        match &task.description {
            Some(desc) => println!("{:<20} {desc}", task.name),
            None => println!("{}", task.name),
        }
    }
}

/// Simple dry-run output: the execution plan with commands and paths.
fn print_dry_run(session: &Session, settings: &RunSettings) -> Result<()> {
    println!("dagbox dry-run");
    println!("  config.image = {}", settings.image);
    println!("  config.location = {}", settings.location);
    println!("  config.parallelism = {}", settings.parallelism);
    println!();

    let plan = session.plan()?;
    println!("plan ({} tasks):", plan.len());
    for task in plan {
        print_task(task);
    }

    debug!("dry-run complete (no execution)");
    Ok(())
}

fn print_task(task: &Task) {
    println!("  - {}", task.name);
    println!("      command: {}", task.command);
    if !task.dependencies.is_empty() {
        println!("      dependencies: {:?}", task.dependencies);
    }
    if !task.input_paths.is_empty() {
        println!("      inputs: {:?}", task.input_paths);
    }
    if !task.excluded_input_paths.is_empty() {
        println!("      excluded: {:?}", task.excluded_input_paths);
    }
    if !task.output_paths.is_empty() {
        println!("      outputs: {:?}", task.output_paths);
    }
    println!("      user: {}", task.user);
    if !task.cache {
        println!("      cache: false");
    }
    if let Some(timeout) = task.timeout {
        println!("      timeout: {timeout:?}");
    }
}
