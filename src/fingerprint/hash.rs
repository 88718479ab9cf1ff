// src/fingerprint/hash.rs

//! Canonical content hashing of workspace paths.

use std::io::Read;
use std::path::{Component, Path};

use anyhow::{Context, Result};
use blake3::Hasher;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::trace;

use crate::fs::FileSystem;

/// BLAKE3 hasher where every field is prefixed with its length, so no two
/// distinct field sequences feed the same byte stream.
pub(crate) struct FieldHasher(Hasher);

impl FieldHasher {
    pub(crate) fn new(domain: &str) -> Self {
        let mut hasher = Self(Hasher::new());
        hasher.field(domain.as_bytes());
        hasher
    }

    pub(crate) fn field(&mut self, bytes: &[u8]) {
        self.0.update(&(bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
    }

    pub(crate) fn str(&mut self, s: &str) {
        self.field(s.as_bytes());
    }

    pub(crate) fn count(&mut self, n: usize) {
        self.field(&(n as u64).to_le_bytes());
    }

    pub(crate) fn finish(self) -> [u8; 32] {
        *self.0.finalize().as_bytes()
    }
}

/// Build a matcher for workspace-relative exclusion globs.
pub fn exclude_set<S: AsRef<str>>(patterns: &[S]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern.as_ref())
            .with_context(|| format!("invalid exclude pattern {:?}", pattern.as_ref()))?;
        builder.add(glob);
    }
    builder.build().context("building exclude set")
}

/// Render a relative path with `/` separators regardless of platform.
pub fn portable_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Hash the file contents behind a single open reader.
pub fn hash_reader(mut reader: impl Read) -> Result<[u8; 32]> {
    let mut hasher = Hasher::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(*hasher.finalize().as_bytes())
}

/// Hash one declared input, which may be a file, a symlink or a directory.
///
/// Directories are hashed from a sorted listing of every entry below them:
/// its workspace-relative path, its kind and its content (file bytes or
/// symlink target). Symlinks are never followed. Entries matched by
/// `excluded` are left out, together with everything beneath them.
///
/// The caller checks existence first.
pub fn hash_input(
    fs: &dyn FileSystem,
    workspace: &Path,
    rel: &Path,
    excluded: &GlobSet,
) -> Result<[u8; 32]> {
    let mut entries = Vec::new();
    collect_entries(fs, workspace, rel, excluded, &mut entries)?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = FieldHasher::new("dagbox-input-v1");
    hasher.count(entries.len());
    for (path, kind, content) in entries {
        hasher.str(&path);
        hasher.str(kind);
        hasher.field(&content);
    }
    Ok(hasher.finish())
}

type Entry = (String, &'static str, Vec<u8>);

fn collect_entries(
    fs: &dyn FileSystem,
    workspace: &Path,
    rel: &Path,
    excluded: &GlobSet,
    out: &mut Vec<Entry>,
) -> Result<()> {
    let portable = portable_path(rel);
    if excluded.is_match(&portable) {
        trace!(path = %portable, "input excluded from hashing");
        return Ok(());
    }

    let abs = workspace.join(rel);
    if fs.is_symlink(&abs) {
        let target = fs.read_link(&abs)?;
        out.push((portable, "link", target.to_string_lossy().into_owned().into_bytes()));
    } else if fs.is_dir(&abs) {
        out.push((portable, "dir", Vec::new()));
        for child in fs.read_dir(&abs)? {
            let Some(name) = child.file_name() else {
                continue;
            };
            collect_entries(fs, workspace, &rel.join(name), excluded, out)?;
        }
    } else {
        let reader = fs.open_read(&abs)?;
        let digest = hash_reader(reader).with_context(|| format!("hashing {:?}", abs))?;
        out.push((portable, "file", digest.to_vec()));
    }
    Ok(())
}
