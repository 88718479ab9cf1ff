// src/container/staging.rs

//! Host-side staging of input trees.
//!
//! Inputs are copied into a temporary directory that mirrors their
//! workspace-relative layout, minus excluded entries, and the whole directory
//! is then copied into the container in one go.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use globset::GlobSet;
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::fingerprint::hash::portable_path;

/// Copy `workspace/rel` to `dest_root/rel`, skipping excluded entries.
///
/// Symlinks are recreated, never followed. Returns the number of entries
/// written.
pub fn copy_tree(
    workspace: &Path,
    rel: &Path,
    dest_root: &Path,
    excluded: &GlobSet,
) -> io::Result<usize> {
    let source = workspace.join(rel);
    fs::symlink_metadata(&source)?;

    let relative_of = |path: &Path| -> PathBuf {
        match path.strip_prefix(&source) {
            Ok(suffix) if suffix.as_os_str().is_empty() => rel.to_path_buf(),
            Ok(suffix) => rel.join(suffix),
            Err(_) => rel.to_path_buf(),
        }
    };

    let mut copied = 0;
    let walker = WalkDir::new(&source)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !excluded.is_match(portable_path(&relative_of(entry.path()))));

    for entry in walker {
        let entry = entry.map_err(io::Error::other)?;
        let rel_path = relative_of(entry.path());
        let target = dest_root.join(&rel_path);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            if file_type.is_symlink() {
                copy_symlink(entry.path(), &target)?;
            } else {
                fs::copy(entry.path(), &target)?;
            }
        }
        trace!(path = %rel_path.display(), "staged");
        copied += 1;
    }

    debug!(input = %rel.display(), entries = copied, "staged input");
    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(source: &Path, target: &Path) -> io::Result<()> {
    let link = fs::read_link(source)?;
    std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, target: &Path) -> io::Result<()> {
    fs::copy(source, target).map(|_| ())
}

/// Replace `destination` with `source`, creating parent directories.
///
/// Moves by rename; across filesystems the tree is copied and the source
/// removed.
pub fn replace_path(source: &Path, destination: &Path) -> io::Result<()> {
    if let Ok(meta) = fs::symlink_metadata(destination) {
        if meta.is_dir() {
            fs::remove_dir_all(destination)?;
        } else {
            fs::remove_file(destination)?;
        }
    }
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(source, destination) {
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            debug!(source = %source.display(), "rename crosses filesystems; copying");
            copy_all(source, destination)?;
            if fs::symlink_metadata(source)?.is_dir() {
                fs::remove_dir_all(source)
            } else {
                fs::remove_file(source)
            }
        }
        other => other,
    }
}

fn copy_all(source: &Path, destination: &Path) -> io::Result<()> {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let target = match entry.path().strip_prefix(source) {
            Ok(suffix) if suffix.as_os_str().is_empty() => destination.to_path_buf(),
            Ok(suffix) => destination.join(suffix),
            Err(_) => continue,
        };
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
