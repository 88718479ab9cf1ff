// src/cache/mod.rs

//! Fingerprint-keyed record of task results.
//!
//! - [`CacheStore`] is the shared handle workers talk to. It layers
//!   corruption checks, the run's read/write switches and in-flight
//!   deduplication over a [`backend::CacheBackend`].
//! - [`backend`] holds the file and memory backends.

pub mod backend;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::container::LayerRef;
use crate::engine::TaskName;
use crate::errors::{DagboxError, Result};
use crate::fingerprint::Fingerprint;
use crate::types::CacheMode;
use backend::{CacheBackend, FileCacheBackend, MemoryCacheBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Succeeded,
    Failed,
}

/// What the cache remembers about one fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status: CacheStatus,
    /// Output paths captured in `layer`.
    #[serde(default)]
    pub outputs: Vec<PathBuf>,
    /// Content of `outputs` as extracted to the workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_digest: Option<Fingerprint>,
    /// Task that produced the entry. Informational only.
    pub task: TaskName,
    /// Unix seconds.
    pub created_at: u64,
    /// Committed container layer holding the task's outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<LayerRef>,
}

impl CacheEntry {
    pub fn succeeded(
        task: &str,
        layer: Option<LayerRef>,
        outputs: Vec<PathBuf>,
        output_digest: Option<Fingerprint>,
    ) -> Self {
        Self {
            status: CacheStatus::Succeeded,
            outputs,
            output_digest,
            task: task.to_string(),
            created_at: unix_now(),
            layer,
        }
    }

    pub fn failed(task: &str) -> Self {
        Self {
            status: CacheStatus::Failed,
            outputs: Vec::new(),
            output_digest: None,
            task: task.to_string(),
            created_at: unix_now(),
            layer: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CacheStatus::Succeeded
    }

    /// Entries describe the same result when status and output content
    /// agree. The layer is where that content is kept; task name and
    /// timestamp are metadata.
    pub fn same_content(&self, other: &CacheEntry) -> bool {
        self.status == other.status && self.output_digest == other.output_digest
    }

    /// Whether the entry recorded every path in `declared`.
    pub fn covers_outputs(&self, declared: &[PathBuf]) -> bool {
        declared.iter().all(|p| self.outputs.contains(p))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Result published by the worker that executed a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotOutcome {
    Succeeded(CacheEntry),
    Failed,
}

/// Outcome of [`CacheStore::claim`].
#[derive(Debug)]
pub enum Claim {
    /// A trusted-looking `succeeded` entry exists.
    Hit(CacheEntry),
    /// The caller is the only executor of this fingerprint in the session.
    Execute(ExecutionSlot),
    /// Another worker is executing the same fingerprint right now.
    Wait(PendingResult),
}

type InFlight = Arc<Mutex<HashMap<Fingerprint, watch::Sender<Option<SlotOutcome>>>>>;

/// Exclusive right to execute one fingerprint.
///
/// Dropping the slot without calling [`ExecutionSlot::complete`] abandons it
/// and wakes the waiters so they can retry.
#[derive(Debug)]
pub struct ExecutionSlot {
    fingerprint: Fingerprint,
    in_flight: InFlight,
    done: bool,
}

impl ExecutionSlot {
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Publish the result to every waiter and release the slot.
    pub fn complete(mut self, outcome: SlotOutcome) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = in_flight.remove(&self.fingerprint) {
            sender.send_replace(Some(outcome));
        }
        self.done = true;
    }
}

impl Drop for ExecutionSlot {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if in_flight.remove(&self.fingerprint).is_some() {
            debug!(fingerprint = %self.fingerprint.short(), "execution slot abandoned");
        }
    }
}

/// What a waiter learns once the executing worker is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Succeeded(CacheEntry),
    Failed,
    /// The executor went away without a result; claim again.
    Abandoned,
}

#[derive(Debug)]
pub struct PendingResult {
    rx: watch::Receiver<Option<SlotOutcome>>,
}

impl PendingResult {
    pub async fn wait(mut self) -> WaitOutcome {
        match self.rx.wait_for(Option::is_some).await {
            Ok(value) => match value.clone() {
                Some(SlotOutcome::Succeeded(entry)) => WaitOutcome::Succeeded(entry),
                Some(SlotOutcome::Failed) => WaitOutcome::Failed,
                None => WaitOutcome::Abandoned,
            },
            Err(_) => WaitOutcome::Abandoned,
        }
    }
}

/// Shared cache handle. Wrap in an `Arc` and hand a clone to each worker.
pub struct CacheStore {
    backend: Box<dyn CacheBackend>,
    in_flight: InFlight,
    read_enabled: bool,
    write_enabled: bool,
}

impl CacheStore {
    pub fn new(backend: Box<dyn CacheBackend>) -> Self {
        Self {
            backend,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            read_enabled: true,
            write_enabled: true,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryCacheBackend::new()))
    }

    /// Open the backend selected by `mode`. `dir` is only used for
    /// [`CacheMode::File`].
    pub fn open(mode: CacheMode, dir: &Path) -> Self {
        match mode {
            CacheMode::File => {
                info!(dir = ?dir, "using file cache");
                Self::new(Box::new(FileCacheBackend::new(dir)))
            }
            CacheMode::Memory => {
                info!("using in-memory cache");
                Self::in_memory()
            }
        }
    }

    pub fn with_read(mut self, enabled: bool) -> Self {
        self.read_enabled = enabled;
        self
    }

    pub fn with_write(mut self, enabled: bool) -> Self {
        self.write_enabled = enabled;
        self
    }

    /// A hit is a `succeeded` entry. Failed entries and disabled reads are
    /// misses.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        if !self.read_enabled {
            return Ok(None);
        }
        let entry = self.backend.load(fingerprint)?;
        Ok(entry.filter(CacheEntry::is_success))
    }

    /// Record the result for `fingerprint`.
    ///
    /// Storing equal content again is a no-op, apart from pointing the entry
    /// at the newer layer when it was committed again. A `failed` entry may
    /// be replaced. Replacing a `succeeded` entry with different content is
    /// [`DagboxError::CacheCorruption`].
    pub fn store(&self, fingerprint: &Fingerprint, entry: CacheEntry) -> Result<()> {
        if !self.write_enabled {
            debug!(fingerprint = %fingerprint.short(), "cache writes disabled; not storing");
            return Ok(());
        }

        if let Some(existing) = self.backend.load(fingerprint)? {
            if existing.same_content(&entry) {
                if existing.layer == entry.layer || entry.layer.is_none() {
                    debug!(fingerprint = %fingerprint.short(), "identical cache entry already stored");
                    return Ok(());
                }
                debug!(
                    fingerprint = %fingerprint.short(),
                    layer = ?entry.layer,
                    "same content committed again; updating layer"
                );
            } else if existing.is_success() {
                warn!(
                    fingerprint = %fingerprint.short(),
                    existing = ?existing.output_digest,
                    new = ?entry.output_digest,
                    "refusing to overwrite succeeded cache entry"
                );
                return Err(DagboxError::CacheCorruption {
                    fingerprint: fingerprint.to_string(),
                });
            } else {
                debug!(fingerprint = %fingerprint.short(), "superseding failed cache entry");
            }
        }

        self.backend.save(fingerprint, &entry)?;
        Ok(())
    }

    /// Atomic lookup-or-reserve.
    pub fn claim(&self, fingerprint: Fingerprint) -> Result<Claim> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = in_flight.get(&fingerprint) {
            return Ok(Claim::Wait(PendingResult {
                rx: sender.subscribe(),
            }));
        }

        if let Some(entry) = self.lookup(&fingerprint)? {
            return Ok(Claim::Hit(entry));
        }

        Ok(self.reserve_locked(&mut in_flight, fingerprint))
    }

    /// Like [`CacheStore::claim`] but never reports a hit. Used for forced
    /// executions and for hits that failed verification.
    pub fn reserve(&self, fingerprint: Fingerprint) -> Claim {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = in_flight.get(&fingerprint) {
            return Claim::Wait(PendingResult {
                rx: sender.subscribe(),
            });
        }
        self.reserve_locked(&mut in_flight, fingerprint)
    }

    fn reserve_locked(
        &self,
        in_flight: &mut HashMap<Fingerprint, watch::Sender<Option<SlotOutcome>>>,
        fingerprint: Fingerprint,
    ) -> Claim {
        let (tx, _rx) = watch::channel(None);
        in_flight.insert(fingerprint, tx);
        Claim::Execute(ExecutionSlot {
            fingerprint,
            in_flight: Arc::clone(&self.in_flight),
            done: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fp(n: u8) -> Fingerprint {
        Fingerprint::from_bytes([n; 32])
    }

    fn ok_entry(image: &str, digest: u8) -> CacheEntry {
        CacheEntry::succeeded(
            "A",
            Some(LayerRef::new(image, format!("dagbox-cache:a-{image}"))),
            vec![PathBuf::from("out.txt")],
            Some(fp(digest)),
        )
    }

    #[test]
    fn store_is_idempotent_for_equal_content() {
        let store = CacheStore::in_memory();
        store.store(&fp(1), ok_entry("c1", 7)).unwrap();
        let mut again = ok_entry("c1", 7);
        again.task = "renamed".into();
        store.store(&fp(1), again).unwrap();
        assert_eq!(store.lookup(&fp(1)).unwrap().unwrap().task, "A");
    }

    #[test]
    fn equal_content_from_a_new_commit_updates_the_layer() {
        let store = CacheStore::in_memory();
        store.store(&fp(1), ok_entry("c1", 7)).unwrap();
        store.store(&fp(1), ok_entry("c2", 7)).unwrap();
        let layer = store.lookup(&fp(1)).unwrap().unwrap().layer.unwrap();
        assert_eq!(layer.image(), "c2");
    }

    #[test]
    fn conflicting_store_is_corruption() {
        let store = CacheStore::in_memory();
        store.store(&fp(1), ok_entry("c1", 7)).unwrap();
        let err = store.store(&fp(1), ok_entry("c2", 8)).unwrap_err();
        assert!(matches!(err, DagboxError::CacheCorruption { .. }));
        assert_eq!(
            store.lookup(&fp(1)).unwrap().unwrap().layer.unwrap().image(),
            "c1"
        );
    }

    #[test]
    fn failed_entries_are_misses_and_can_be_superseded() {
        let store = CacheStore::in_memory();
        store.store(&fp(1), CacheEntry::failed("A")).unwrap();
        assert!(store.lookup(&fp(1)).unwrap().is_none());

        store.store(&fp(1), ok_entry("c1", 7)).unwrap();
        assert!(store.lookup(&fp(1)).unwrap().is_some());
    }

    #[test]
    fn disabled_read_and_write() {
        let store = CacheStore::in_memory().with_write(false);
        store.store(&fp(1), ok_entry("c1", 7)).unwrap();
        assert!(store.lookup(&fp(1)).unwrap().is_none());

        let store = CacheStore::in_memory().with_read(false);
        store.store(&fp(1), ok_entry("c1", 7)).unwrap();
        assert!(store.lookup(&fp(1)).unwrap().is_none());
        assert!(matches!(store.claim(fp(1)).unwrap(), Claim::Execute(_)));
    }

    #[test]
    fn claim_reports_hits() {
        let store = CacheStore::in_memory();
        store.store(&fp(1), ok_entry("c1", 7)).unwrap();
        match store.claim(fp(1)).unwrap() {
            Claim::Hit(entry) => assert_eq!(entry.output_digest, Some(fp(7))),
            other => panic!("expected hit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_claim_waits_for_the_executor() {
        let store = Arc::new(CacheStore::in_memory());
        let Claim::Execute(slot) = store.claim(fp(9)).unwrap() else {
            panic!("first claim must execute");
        };
        let Claim::Wait(pending) = store.claim(fp(9)).unwrap() else {
            panic!("second claim must wait");
        };

        let waiter = tokio::spawn(pending.wait());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let entry = ok_entry("c9", 9);
        store.store(&fp(9), entry.clone()).unwrap();
        slot.complete(SlotOutcome::Succeeded(entry.clone()));

        assert_eq!(waiter.await.unwrap(), WaitOutcome::Succeeded(entry));
        // The slot is released; later claims see the stored entry.
        assert!(matches!(store.claim(fp(9)).unwrap(), Claim::Hit(_)));
    }

    #[tokio::test]
    async fn dropped_slot_wakes_waiters_as_abandoned() {
        let store = CacheStore::in_memory();
        let Claim::Execute(slot) = store.reserve(fp(2)) else {
            panic!("expected slot");
        };
        let Claim::Wait(pending) = store.reserve(fp(2)) else {
            panic!("expected wait");
        };
        drop(slot);
        assert_eq!(pending.wait().await, WaitOutcome::Abandoned);
        assert!(matches!(store.reserve(fp(2)), Claim::Execute(_)));
    }

    #[tokio::test]
    async fn failed_executor_fails_waiters() {
        let store = CacheStore::in_memory();
        let Claim::Execute(slot) = store.claim(fp(3)).unwrap() else {
            panic!("expected slot");
        };
        let Claim::Wait(pending) = store.claim(fp(3)).unwrap() else {
            panic!("expected wait");
        };
        slot.complete(SlotOutcome::Failed);
        assert_eq!(pending.wait().await, WaitOutcome::Failed);
    }

    #[test]
    fn covers_outputs_checks_every_declared_path() {
        let entry = ok_entry("c1", 7);
        assert!(entry.covers_outputs(&[PathBuf::from("out.txt")]));
        assert!(!entry.covers_outputs(&[PathBuf::from("out.txt"), PathBuf::from("b")]));
    }
}
