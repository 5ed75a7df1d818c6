//! Mirror-directory staging for module files.
//!
//! Libraries are copied out of the watched tree into a flat mirror
//! directory and loaded from there, so the originals stay unlocked and can
//! be replaced while a module is running. Copies go through a temp file in
//! the destination directory and are persisted with a rename.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::platform::is_module_file;

/// Copy every module file under `src` (recursively) into the flat
/// directory `dst`. Unreadable entries are skipped with a warning; a
/// destination nested inside the source is not descended into. Returns the
/// number of files copied.
pub fn mirror_modules(src: &Path, dst: &Path) -> io::Result<usize> {
    fs::create_dir_all(dst)?;
    let src = src.canonicalize()?;
    let dst = dst.canonicalize()?;
    tracing::info!(src = %src.display(), dst = %dst.display(), "staging module files");

    let mut copied = 0;
    let mut pending = vec![src];
    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "skipping unreadable directory");
                continue;
            }
        };
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            let path = entry.path();
            if path == dst {
                continue;
            }
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            if !is_module_file(&path) {
                continue;
            }
            let Some(name) = path.file_name() else {
                continue;
            };
            let target = dst.join(name);
            match copy_atomic(&path, &target) {
                Ok(()) => {
                    tracing::debug!(src = %path.display(), dst = %target.display(), "staged module file");
                    copied += 1;
                }
                Err(e) => {
                    tracing::warn!(src = %path.display(), error = %e, "failed to stage module file");
                }
            }
        }
    }
    Ok(copied)
}

/// Write `dst` via a temp file in the same directory, then rename over it.
/// A reader never observes a partially written library.
pub(crate) fn copy_atomic(src: &Path, dst: &Path) -> io::Result<()> {
    let dir = dst.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    let mut reader = fs::File::open(src)?;
    io::copy(&mut reader, tmp.as_file_mut())?;

    #[cfg(unix)]
    {
        let mode = reader.metadata()?.permissions();
        tmp.as_file().set_permissions(mode)?;
    }

    tmp.persist(dst).map_err(|e| e.error)?;
    Ok(())
}

/// Staged location for a source library.
pub fn staged_path(mirror: &Path, src: &Path) -> Option<PathBuf> {
    src.file_name().map(|name| mirror.join(name))
}
