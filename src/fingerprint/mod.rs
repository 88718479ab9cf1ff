// src/fingerprint/mod.rs

//! Deterministic cache keys for tasks.
//!
//! A task's fingerprint covers everything that can change what the task
//! produces: the base image and working location, the command, the user, the
//! environment, the content of every declared input, the declared outputs and
//! the fingerprints of its direct dependencies in declared order.

pub mod hash;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::dag::task::Task;
use crate::errors::{DagboxError, Result};
use crate::fs::FileSystem;
use hash::{FieldHasher, exclude_set, hash_input, portable_path};

/// 32-byte BLAKE3 digest, rendered as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    /// First twelve hex characters, for log lines and reports.
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        blake3::Hash::from_hex(s.trim())
            .map(|h| Self(*h.as_bytes()))
            .map_err(|e| format!("invalid fingerprint {s:?}: {e}"))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Computes fingerprints against one workspace and run configuration.
#[derive(Debug, Clone)]
pub struct FingerprintEngine {
    fs: Arc<dyn FileSystem>,
    workspace: PathBuf,
    image: String,
    location: String,
}

impl FingerprintEngine {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        workspace: impl Into<PathBuf>,
        image: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            fs,
            workspace: workspace.into(),
            image: image.into(),
            location: location.into(),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn filesystem(&self) -> &dyn FileSystem {
        self.fs.as_ref()
    }

    /// Cache key of `task` given the final fingerprints of its direct
    /// dependencies, in declared order.
    ///
    /// Reads input content from the workspace; call from a blocking context.
    pub fn fingerprint(&self, task: &Task, dependencies: &[Fingerprint]) -> Result<Fingerprint> {
        let excluded = exclude_set(&task.excluded_input_paths)?;

        let mut inputs: Vec<&PathBuf> = task.input_paths.iter().collect();
        inputs.sort();
        inputs.dedup();

        let mut hasher = FieldHasher::new("dagbox-fingerprint-v1");
        hasher.str(&self.image);
        hasher.str(&self.location);
        hasher.str(&task.command);
        hasher.str(&task.user);

        hasher.count(task.environment.len());
        for (key, value) in &task.environment {
            hasher.str(key);
            hasher.str(value);
        }

        hasher.count(inputs.len());
        for rel in inputs {
            if !self.fs.exists(&self.workspace.join(rel)) {
                return Err(DagboxError::InputPathMissing {
                    task: task.name.clone(),
                    path: rel.clone(),
                });
            }
            let content = hash_input(self.fs.as_ref(), &self.workspace, rel, &excluded)?;
            hasher.str(&portable_path(rel));
            hasher.field(&content);
        }

        hasher.count(task.excluded_input_paths.len());
        for pattern in &task.excluded_input_paths {
            hasher.str(pattern);
        }

        hasher.count(task.output_paths.len());
        for output in &task.output_paths {
            hasher.str(&portable_path(output));
        }

        hasher.count(dependencies.len());
        for dep in dependencies {
            hasher.field(dep.as_bytes());
        }

        let fingerprint = Fingerprint(hasher.finish());
        debug!(task = %task.name, fingerprint = %fingerprint.short(), "computed fingerprint");
        Ok(fingerprint)
    }

    /// Digest of what `outputs` currently hold in the workspace.
    ///
    /// Recorded when a result is stored and compared on every cache hit, so
    /// a hit is only trusted while the host still has exactly what the task
    /// produced. Fails if an output is missing. Call from a blocking context.
    pub fn output_digest(&self, outputs: &[PathBuf]) -> Result<Fingerprint> {
        let mut sorted: Vec<&PathBuf> = outputs.iter().collect();
        sorted.sort();
        sorted.dedup();

        let none = exclude_set::<&str>(&[])?;
        let mut hasher = FieldHasher::new("dagbox-outputs-v1");
        hasher.count(sorted.len());
        for rel in sorted {
            if !self.fs.exists(&self.workspace.join(rel)) {
                return Err(DagboxError::Other(anyhow::anyhow!(
                    "declared output {:?} does not exist",
                    rel
                )));
            }
            hasher.str(&portable_path(rel));
            hasher.field(&hash_input(self.fs.as_ref(), &self.workspace, rel, &none)?);
        }
        Ok(Fingerprint(hasher.finish()))
    }
}
