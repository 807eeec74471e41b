//! Failure-atomic file writes: stage in a temp file beside the target, then rename.

use std::{io::Write, path::Path};

use tempfile::NamedTempFile;

use crate::error::{ForecastError, Result};

/// Runs `write` against a temp path in `target`'s directory and renames the
/// result over `target`. On any failure the temp file is removed and
/// `target` is left untouched.
pub fn write_with<F>(target: &Path, write: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let dir = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let staged = tempfile::Builder::new()
        .prefix(".staging-")
        .tempfile_in(dir)
        .map_err(|err| ForecastError::persistence(target, err))?;
    write(staged.path())?;
    finalize(staged, target)
}

/// Atomically replaces `target` with `bytes`.
pub fn write_bytes(target: &Path, bytes: &[u8]) -> Result<()> {
    write_with(target, |staged| {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(staged)
            .map_err(|err| ForecastError::persistence(target, err))?;
        file.write_all(bytes)
            .and_then(|()| file.sync_all())
            .map_err(|err| ForecastError::persistence(target, err))
    })
}

fn finalize(staged: NamedTempFile, target: &Path) -> Result<()> {
    staged
        .persist(target)
        .map(drop)
        .map_err(|err| ForecastError::persistence(target, err.error))
}
