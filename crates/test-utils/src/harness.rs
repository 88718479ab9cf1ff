#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use dagbox::cache::CacheStore;
use dagbox::dag::TaskGraph;
use dagbox::engine::{Session, SessionOptions, SessionOutcome};
use dagbox::errors::Result;
use dagbox::fingerprint::FingerprintEngine;
use dagbox::fs::RealFileSystem;
use tempfile::TempDir;
use tokio::sync::watch;

use crate::fake_runtime::FakeRuntime;

/// A temporary workspace, a fake runtime and a cache that outlive
/// individual sessions, so tests can run the same graph several times.
pub struct Harness {
    pub workspace: TempDir,
    pub runtime: Arc<FakeRuntime>,
    pub cache: Arc<CacheStore>,
    pub options: SessionOptions,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_cache(CacheStore::in_memory())
    }

    pub fn with_cache(cache: CacheStore) -> Self {
        Self {
            workspace: tempfile::tempdir().expect("create workspace"),
            runtime: Arc::new(FakeRuntime::new()),
            cache: Arc::new(cache),
            options: SessionOptions {
                parallelism: 4,
                ..SessionOptions::default()
            },
        }
    }

    pub fn path(&self) -> &Path {
        self.workspace.path()
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent");
        }
        std::fs::write(path, contents).expect("write workspace file");
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.path().join(rel)).expect("read workspace file")
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.path().join(rel).exists()
    }

    pub fn remove(&self, rel: &str) {
        std::fs::remove_file(self.path().join(rel)).expect("remove workspace file");
    }

    pub fn fingerprints(&self) -> Arc<FingerprintEngine> {
        Arc::new(FingerprintEngine::new(
            Arc::new(RealFileSystem),
            self.path(),
            self.options.image.as_str(),
            self.options.location.as_str(),
        ))
    }

    pub fn session(&self, graph: &TaskGraph, selection: &[&str]) -> Result<Session> {
        let selection: Vec<String> = selection.iter().map(|s| s.to_string()).collect();
        Session::new(
            Arc::new(graph.clone()),
            &selection,
            self.runtime.clone(),
            Arc::clone(&self.cache),
            self.fingerprints(),
            self.options.clone(),
        )
    }

    /// Run a session that is never cancelled.
    pub async fn run(&self, graph: &TaskGraph, selection: &[&str]) -> SessionOutcome {
        let (_tx, rx) = watch::channel(false);
        self.session(graph, selection)
            .expect("valid session")
            .run(rx)
            .await
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
