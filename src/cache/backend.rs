// src/cache/backend.rs

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::cache::CacheEntry;
use crate::fingerprint::Fingerprint;

/// Abstract storage for cache entries.
pub trait CacheBackend: Send + Sync {
    fn load(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>>;
    fn save(&self, fingerprint: &Fingerprint, entry: &CacheEntry) -> Result<()>;
}

/// One TOML document per fingerprint: `<dir>/<fingerprint>.toml`.
pub struct FileCacheBackend {
    dir: PathBuf,
}

impl FileCacheBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{fingerprint}.toml"))
    }
}

impl CacheBackend for FileCacheBackend {
    fn load(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(fingerprint);
        if !path.exists() {
            return Ok(None);
        }

        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading cache entry at {:?}", path))?;
        let entry: CacheEntry = toml::from_str(&text)
            .with_context(|| format!("parsing cache entry at {:?}", path))?;
        debug!(fingerprint = %fingerprint.short(), path = ?path, "loaded cache entry (file)");
        Ok(Some(entry))
    }

    fn save(&self, fingerprint: &Fingerprint, entry: &CacheEntry) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating cache directory at {:?}", self.dir))?;

        let text = toml::to_string(entry).context("serializing cache entry")?;
        let path = self.entry_path(fingerprint);

        // Write next to the target and rename, so readers never see a
        // partial document.
        let mut tmp = NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("creating temp file in {:?}", self.dir))?;
        tmp.write_all(text.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&path)
            .with_context(|| format!("persisting cache entry at {:?}", path))?;

        info!(
            fingerprint = %fingerprint.short(),
            task = %entry.task,
            status = ?entry.status,
            "stored cache entry (file)"
        );
        Ok(())
    }
}

/// Stores entries in memory only (lost when the process exits).
#[derive(Default)]
pub struct MemoryCacheBackend {
    map: Mutex<HashMap<Fingerprint, CacheEntry>>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheBackend for MemoryCacheBackend {
    fn load(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        let map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(fingerprint).cloned())
    }

    fn save(&self, fingerprint: &Fingerprint, entry: &CacheEntry) -> Result<()> {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        map.insert(*fingerprint, entry.clone());
        info!(
            fingerprint = %fingerprint.short(),
            task = %entry.task,
            status = ?entry.status,
            "stored cache entry (memory)"
        );
        Ok(())
    }
}
