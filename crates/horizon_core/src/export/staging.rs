//! Atomic directory writes.
//!
//! Files are rendered into a sibling staging directory and only swapped into
//! place once every file has been flushed and synced. A failure at any point
//! removes the staging directory and leaves an existing target untouched.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{OcpError, Result};

fn sibling(target: &Path, tag: &str) -> Result<PathBuf> {
    let name = target
        .file_name()
        .ok_or_else(|| {
            OcpError::io(
                target,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "export target has no directory name"),
            )
        })?
        .to_string_lossy();
    let dir = format!(".{name}.{tag}-{}", std::process::id());
    Ok(match target.parent() {
        Some(parent) => parent.join(dir),
        None => PathBuf::from(dir),
    })
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    let file = File::create(path).map_err(|e| OcpError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(contents.as_bytes())
        .map_err(|e| OcpError::io(path, e))?;
    writer.flush().map_err(|e| OcpError::io(path, e))?;
    writer.get_ref().sync_all().map_err(|e| OcpError::io(path, e))
}

fn stage(staging: &Path, files: &BTreeMap<String, String>) -> Result<()> {
    fs::create_dir(staging).map_err(|e| OcpError::io(staging, e))?;
    for (name, contents) in files {
        write_file(&staging.join(name), contents)?;
    }
    Ok(())
}

fn swap(staging: &Path, target: &Path) -> Result<()> {
    if !target.exists() {
        return fs::rename(staging, target).map_err(|e| OcpError::io(target, e));
    }
    let previous = sibling(target, "previous")?;
    fs::rename(target, &previous).map_err(|e| OcpError::io(target, e))?;
    if let Err(e) = fs::rename(staging, target) {
        // put the old export back before reporting
        if let Err(restore) = fs::rename(&previous, target) {
            warn!(path = %previous.display(), error = %restore, "failed to restore previous export");
        }
        return Err(OcpError::io(target, e));
    }
    if let Err(e) = fs::remove_dir_all(&previous) {
        warn!(path = %previous.display(), error = %e, "failed to remove previous export");
    }
    Ok(())
}

/// Writes `files` into `target`, replacing its previous contents, or leaves the
/// filesystem as it was.
pub(crate) fn write_atomically(target: &Path, files: &BTreeMap<String, String>) -> Result<()> {
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| OcpError::io(parent, e))?;
    }
    if target.exists() && !target.is_dir() {
        return Err(OcpError::io(
            target,
            std::io::Error::new(std::io::ErrorKind::AlreadyExists, "export target exists and is not a directory"),
        ));
    }

    let staging = sibling(target, "staging")?;
    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(|e| OcpError::io(&staging, e))?;
    }
    debug!(staging = %staging.display(), files = files.len(), "staging export");

    let result = stage(&staging, files).and_then(|()| swap(&staging, target));
    if result.is_err() && staging.exists() {
        if let Err(e) = fs::remove_dir_all(&staging) {
            warn!(path = %staging.display(), error = %e, "failed to remove staging directory");
        }
    }
    result
}
