// src/engine/worker.rs

//! Runs one scheduled task: fingerprint, cache claim, and (on a miss) the
//! container round trip.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheEntry, CacheStore, Claim, SlotOutcome, WaitOutcome};
use crate::container::{
    ContainerError, ContainerGuard, ContainerRuntime, ExecOutput, ExecRequest, LayerRef,
};
use crate::dag::{Completion, ScheduledTask, TaskIndex, TaskStatus};
use crate::engine::{FailureKind, SessionOptions, TaskReport};
use crate::errors::DagboxError;
use crate::fingerprint::hash::exclude_set;
use crate::fingerprint::{Fingerprint, FingerprintEngine};

/// Everything a worker needs, shared across all workers of a session.
#[derive(Clone)]
pub struct WorkerContext {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub cache: Arc<CacheStore>,
    pub fingerprints: Arc<FingerprintEngine>,
    pub options: Arc<SessionOptions>,
}

/// What a worker hands back to the session loop.
#[derive(Debug)]
pub struct WorkerResult {
    pub index: TaskIndex,
    pub completion: Completion,
    pub report: TaskReport,
}

/// A task that did not succeed, with whatever the command printed.
#[derive(Debug, Clone)]
struct Failure {
    kind: FailureKind,
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
    message: String,
}

impl Failure {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            message: message.into(),
        }
    }

    fn infrastructure(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Infrastructure, message)
    }

    fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "session cancelled")
    }

    fn from_container(err: ContainerError) -> Self {
        let kind = match &err {
            ContainerError::ExecutionTimeout { .. } => FailureKind::Timeout,
            ContainerError::OutputMissing { .. } => FailureKind::OutputMissing,
            _ => FailureKind::Infrastructure,
        };
        Self::new(kind, err.to_string())
    }

    fn with_output(mut self, output: &ExecOutput) -> Self {
        self.exit_code = Some(output.exit_code);
        self.stdout = output.stdout.clone();
        self.stderr = output.stderr.clone();
        self
    }

    /// Failures that say something about the fingerprint itself, and so are
    /// worth remembering in the cache.
    fn is_deterministic(&self) -> bool {
        matches!(
            self.kind,
            FailureKind::NonZeroExit | FailureKind::Timeout | FailureKind::OutputMissing
        )
    }
}

/// A successful container round trip.
struct Executed {
    output: ExecOutput,
    layer: Option<LayerRef>,
    output_digest: Option<Fingerprint>,
}

/// Run `task` to completion. Never fails: every problem becomes a typed
/// outcome on the returned report.
pub async fn run_task(
    ctx: WorkerContext,
    task: ScheduledTask,
    mut cancel: watch::Receiver<bool>,
) -> WorkerResult {
    let started = Instant::now();
    let index = task.index;
    info!(task = %task.name(), "task started");

    let fingerprint = match compute_fingerprint(&ctx, &task).await {
        Ok(fp) => fp,
        Err(failure) => return failed(&task, None, failure, started),
    };

    let outcome = if task.caching_enabled {
        run_cached(&ctx, &task, fingerprint, &mut cancel).await
    } else {
        debug!(task = %task.name(), "caching disabled; executing without cache");
        execute(&ctx, &task, fingerprint, false, &mut cancel)
            .await
            .map(|done| (done.output, false))
    };

    match outcome {
        Ok((output, cached)) => {
            let status = if cached {
                TaskStatus::CachedSucceeded
            } else {
                TaskStatus::Succeeded
            };
            info!(
                task = %task.name(),
                fingerprint = %fingerprint.short(),
                status = status.label(),
                "task succeeded"
            );
            let mut report = TaskReport::new(task.name(), status);
            report.exit_code = (!cached).then_some(output.exit_code);
            report.stdout = output.stdout;
            report.stderr = output.stderr;
            report.duration = started.elapsed();
            report.fingerprint = Some(fingerprint);
            WorkerResult {
                index,
                completion: Completion::Succeeded {
                    fingerprint,
                    cached,
                },
                report,
            }
        }
        Err(failure) => failed(&task, Some(fingerprint), failure, started),
    }
}

async fn compute_fingerprint(
    ctx: &WorkerContext,
    task: &ScheduledTask,
) -> Result<Fingerprint, Failure> {
    let engine = Arc::clone(&ctx.fingerprints);
    let record = task.task.clone();
    let deps = task.dependency_fingerprints.clone();

    let joined = tokio::task::spawn_blocking(move || engine.fingerprint(&record, &deps)).await;
    match joined {
        Ok(Ok(fp)) => Ok(fp),
        Ok(Err(DagboxError::InputPathMissing { path, .. })) => Err(Failure::new(
            FailureKind::InputPathMissing,
            format!("declared input {:?} does not exist", path),
        )),
        Ok(Err(e)) => Err(Failure::infrastructure(format!("fingerprinting failed: {e}"))),
        Err(e) => Err(Failure::infrastructure(format!("fingerprint task panicked: {e}"))),
    }
}

/// Claim the fingerprint and either reuse, wait for, or produce its result.
///
/// Returns the command output and whether it came from the cache.
async fn run_cached(
    ctx: &WorkerContext,
    task: &ScheduledTask,
    fingerprint: Fingerprint,
    cancel: &mut watch::Receiver<bool>,
) -> Result<(ExecOutput, bool), Failure> {
    let mut skip_lookup = ctx.options.is_forced(task.name());
    if skip_lookup {
        info!(task = %task.name(), "forced; skipping cache lookup");
    }

    loop {
        let claim = if skip_lookup {
            ctx.cache.reserve(fingerprint)
        } else {
            ctx.cache
                .claim(fingerprint)
                .map_err(|e| Failure::infrastructure(format!("cache lookup failed: {e}")))?
        };

        match claim {
            Claim::Hit(entry) => {
                if verify_hit(ctx, task, &entry).await {
                    info!(task = %task.name(), layer = ?entry.layer, "cache hit");
                    return Ok((ExecOutput::default(), true));
                }
                skip_lookup = true;
            }
            Claim::Wait(pending) => {
                info!(
                    task = %task.name(),
                    fingerprint = %fingerprint.short(),
                    "identical task already running; waiting for its result"
                );
                let outcome = tokio::select! {
                    outcome = pending.wait() => outcome,
                    _ = cancelled(cancel) => return Err(Failure::cancelled()),
                };
                match outcome {
                    WaitOutcome::Succeeded(_) => return Ok((ExecOutput::default(), true)),
                    WaitOutcome::Failed => {
                        return Err(Failure::new(
                            FailureKind::SharedFailure,
                            "a task with the same fingerprint failed in this session",
                        ));
                    }
                    WaitOutcome::Abandoned => {
                        debug!(task = %task.name(), "executor abandoned fingerprint; claiming again");
                    }
                }
            }
            Claim::Execute(slot) => {
                return match execute(ctx, task, fingerprint, true, cancel).await {
                    Ok(done) => {
                        let entry = CacheEntry::succeeded(
                            task.name(),
                            done.layer,
                            task.task.output_paths.clone(),
                            done.output_digest,
                        );
                        if let Err(e) = ctx.cache.store(&fingerprint, entry.clone()) {
                            slot.complete(SlotOutcome::Failed);
                            return Err(Failure::infrastructure(format!(
                                "storing cache entry failed: {e}"
                            ))
                            .with_output(&done.output));
                        }
                        slot.complete(SlotOutcome::Succeeded(entry));
                        Ok((done.output, false))
                    }
                    Err(failure) if failure.kind == FailureKind::Cancelled => {
                        drop(slot);
                        Err(failure)
                    }
                    Err(failure) => {
                        if failure.is_deterministic() {
                            if let Err(e) =
                                ctx.cache.store(&fingerprint, CacheEntry::failed(task.name()))
                            {
                                warn!(task = %task.name(), error = %e, "unable to record failure in cache");
                            }
                        }
                        slot.complete(SlotOutcome::Failed);
                        Err(failure)
                    }
                };
            }
        }
    }
}

/// A hit is only trusted when the entry succeeded, recorded every declared
/// output, its layer still exists, and the workspace still holds exactly the
/// outputs it recorded.
async fn verify_hit(ctx: &WorkerContext, task: &ScheduledTask, entry: &CacheEntry) -> bool {
    if !entry.is_success() || !entry.covers_outputs(&task.task.output_paths) {
        info!(task = %task.name(), "cache entry does not cover declared outputs; re-running");
        return false;
    }

    let Some(layer) = &entry.layer else {
        info!(task = %task.name(), "cache entry has no layer; re-running");
        return false;
    };
    match ctx.runtime.layer_exists(layer).await {
        Ok(true) => {}
        Ok(false) => {
            info!(task = %task.name(), %layer, "cached layer is gone; re-running");
            return false;
        }
        Err(e) => {
            warn!(task = %task.name(), %layer, error = %e, "unable to inspect cached layer; re-running");
            return false;
        }
    }

    match digest_outputs(ctx, &task.task.output_paths).await {
        Ok(digest) if Some(digest) == entry.output_digest => true,
        Ok(_) => {
            info!(task = %task.name(), "workspace outputs differ from cached result; re-running");
            false
        }
        Err(reason) => {
            info!(task = %task.name(), %reason, "cached outputs unavailable in workspace; re-running");
            false
        }
    }
}

async fn digest_outputs(ctx: &WorkerContext, outputs: &[PathBuf]) -> Result<Fingerprint, String> {
    let engine = Arc::clone(&ctx.fingerprints);
    let outputs = outputs.to_vec();
    match tokio::task::spawn_blocking(move || engine.output_digest(&outputs)).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(e) => Err(format!("output digest task panicked: {e}")),
    }
}

/// Create a container, run the task in it, and release it on every path.
async fn execute(
    ctx: &WorkerContext,
    task: &ScheduledTask,
    fingerprint: Fingerprint,
    commit: bool,
    cancel: &mut watch::Receiver<bool>,
) -> Result<Executed, Failure> {
    // Creation is not raced against cancellation: the engine may finish
    // creating a container its client never hears about.
    let guard = ContainerGuard::create(Arc::clone(&ctx.runtime), &ctx.options.image)
        .await
        .map_err(Failure::from_container)?;
    let cancelled_early = *cancel.borrow();
    if cancelled_early {
        info!(task = %task.name(), "cancellation requested; releasing new container");
        guard.release().await;
        return Err(Failure::cancelled());
    }

    let result = tokio::select! {
        result = execute_in(ctx, &guard, task, fingerprint, commit) => result,
        _ = cancelled(cancel) => {
            info!(task = %task.name(), "cancellation requested; stopping task");
            Err(Failure::cancelled())
        }
    };

    guard.release().await;
    result
}

async fn execute_in(
    ctx: &WorkerContext,
    guard: &ContainerGuard,
    task: &ScheduledTask,
    fingerprint: Fingerprint,
    commit: bool,
) -> Result<Executed, Failure> {
    let runtime = &ctx.runtime;
    let id = guard.id();
    let workspace = ctx.fingerprints.workspace();

    let excluded = exclude_set(&task.task.excluded_input_paths)
        .map_err(|e| Failure::infrastructure(e.to_string()))?;
    let mut inputs: Vec<PathBuf> = task.inherited_paths.clone();
    for path in &task.task.input_paths {
        if !inputs.contains(path) {
            inputs.push(path.clone());
        }
    }
    runtime
        .materialize_inputs(id, workspace, &inputs, &excluded)
        .await
        .map_err(Failure::from_container)?;

    let request = ExecRequest {
        command: task.task.command.clone(),
        user: task.task.user.clone(),
        environment: task.task.environment.clone(),
        location: ctx.options.location.clone(),
        timeout: task.task.timeout.or(ctx.options.default_timeout),
    };
    debug!(task = %task.name(), container = %id, user = %request.user, "running command");
    let output = runtime
        .exec_as(id, &request)
        .await
        .map_err(Failure::from_container)?;

    if !output.success() {
        return Err(Failure::new(
            FailureKind::NonZeroExit,
            format!("command exited with status {}", output.exit_code),
        )
        .with_output(&output));
    }

    runtime
        .extract_outputs(id, workspace, &task.task.output_paths)
        .await
        .map_err(|e| Failure::from_container(e).with_output(&output))?;

    if !commit {
        return Ok(Executed {
            output,
            layer: None,
            output_digest: None,
        });
    }

    let output_digest = digest_outputs(ctx, &task.task.output_paths)
        .await
        .map_err(|e| {
            Failure::infrastructure(format!("hashing extracted outputs failed: {e}"))
                .with_output(&output)
        })?;
    let tag = ctx.options.layer_tag(&fingerprint);
    let layer = runtime
        .commit_layer(id, &tag)
        .await
        .map_err(|e| Failure::from_container(e).with_output(&output))?;

    Ok(Executed {
        output,
        layer: Some(layer),
        output_digest: Some(output_digest),
    })
}

/// Resolves once the session is cancelled; never resolves if the sender is
/// dropped without cancelling.
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn failed(
    task: &ScheduledTask,
    fingerprint: Option<Fingerprint>,
    failure: Failure,
    started: Instant,
) -> WorkerResult {
    if failure.kind == FailureKind::Infrastructure {
        error!(
            task = %task.name(),
            infrastructure = true,
            error = %failure.message,
            "task failed"
        );
    } else {
        warn!(
            task = %task.name(),
            kind = failure.kind.label(),
            exit_code = ?failure.exit_code,
            "task failed"
        );
    }

    let mut report = TaskReport::new(task.name(), TaskStatus::Failed);
    report.exit_code = failure.exit_code;
    report.stdout = failure.stdout;
    report.stderr = failure.stderr;
    report.duration = started.elapsed();
    report.fingerprint = fingerprint;
    report.failure = Some(failure.kind);
    report.message = Some(failure.message);

    WorkerResult {
        index: task.index,
        completion: Completion::Failed,
        report,
    }
}
