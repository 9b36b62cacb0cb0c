//! Filesystem helpers for replacing package files atomically.
//!
//! Every rewrite goes through [`atomic_write`]:
//! - write to a temp file in the same directory (avoids cross-device renames)
//! - flush + `sync_all`
//! - rename into place with replace semantics (including on Windows)
//!
//! Temp files are named with [`TEMP_FILE_PREFIX`] so leftovers from an interrupted process can be
//! recognized and discarded with [`clean_stale_temp_files`].

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::{Builder, NamedTempFile};

/// File-name prefix used for every temp file created by [`atomic_write`].
pub const TEMP_FILE_PREFIX: &str = ".pbix-rewrite-";

const TEMP_FILE_SUFFIX: &str = ".tmp";

#[derive(Debug, thiserror::Error)]
pub enum AtomicWriteError<E> {
    #[error("io error: {0}")]
    Io(#[source] io::Error),
    #[error("write error: {0}")]
    Writer(#[source] E),
}

impl<E> From<io::Error> for AtomicWriteError<E> {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

fn parent_dir_or_dot(path: &Path) -> &Path {
    // `Path::parent` returns `Some("")` for bare relative file names like `report.pbix`.
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

fn new_temp_file_in(dir: &Path) -> io::Result<NamedTempFile> {
    Builder::new()
        .prefix(TEMP_FILE_PREFIX)
        .suffix(TEMP_FILE_SUFFIX)
        .tempfile_in(dir)
}

/// Atomically write a file by:
/// - creating parent directories (if needed)
/// - writing to a temp file in the same directory
/// - flushing + syncing the temp file
/// - carrying over the permissions of an existing destination
/// - renaming it into place with replace semantics
///
/// If `write_fn` returns an error (or any step before the rename fails), the destination file is
/// left untouched and the temp file is removed.
pub fn atomic_write<T, E>(
    dest: impl AsRef<Path>,
    write_fn: impl FnOnce(&mut File) -> Result<T, E>,
) -> Result<T, AtomicWriteError<E>> {
    let dest = dest.as_ref();
    let dir = parent_dir_or_dot(dest);
    fs::create_dir_all(dir).map_err(AtomicWriteError::Io)?;

    let mut tmp = new_temp_file_in(dir).map_err(AtomicWriteError::Io)?;
    log::debug!(
        "writing {} via temp file {}",
        dest.display(),
        tmp.path().display()
    );
    let out = write_fn(tmp.as_file_mut()).map_err(AtomicWriteError::Writer)?;

    tmp.as_file_mut().flush().map_err(AtomicWriteError::Io)?;
    tmp.as_file().sync_all().map_err(AtomicWriteError::Io)?;

    if let Ok(meta) = fs::metadata(dest) {
        tmp.as_file()
            .set_permissions(meta.permissions())
            .map_err(AtomicWriteError::Io)?;
    }

    // Closes the handle; the `TempPath` still deletes the file if the rename fails.
    let tmp_path = tmp.into_temp_path();
    replace_file(tmp_path.as_ref(), dest).map_err(AtomicWriteError::Io)?;
    // The temp path no longer exists after the rename; nothing left to clean up.
    let _ = tmp_path.keep();

    // Best-effort: sync directory metadata after the rename.
    let _ = sync_parent_dir(dest);

    Ok(out)
}

/// Returns true when `path` names a temp file produced by [`atomic_write`].
pub fn is_temp_artifact(path: impl AsRef<Path>) -> bool {
    path.as_ref()
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(TEMP_FILE_PREFIX) && name.ends_with(TEMP_FILE_SUFFIX))
}

/// List temp files left in `dir` by interrupted writes.
pub fn stale_temp_files(dir: impl AsRef<Path>) -> io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file() && is_temp_artifact(&path) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Delete temp files left in `dir` by interrupted writes and return the removed paths.
///
/// Callers must make sure no rewrite is running in `dir` at the same time.
pub fn clean_stale_temp_files(dir: impl AsRef<Path>) -> io::Result<Vec<PathBuf>> {
    let stale = stale_temp_files(dir)?;
    for path in &stale {
        log::warn!("removing stale temp file {}", path.display());
        fs::remove_file(path)?;
    }
    Ok(stale)
}

fn sync_parent_dir(path: &Path) -> io::Result<()> {
    let parent = parent_dir_or_dot(path);
    // Opening a directory as a file is not supported everywhere; callers treat this as best-effort.
    let dir = File::open(parent)?;
    dir.sync_all()
}

fn replace_file(from: &Path, to: &Path) -> io::Result<()> {
    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt as _;
        use windows_sys::Win32::Storage::FileSystem::{MoveFileExW, MOVEFILE_REPLACE_EXISTING};

        fn to_wide_null(path: &Path) -> Vec<u16> {
            let mut wide: Vec<u16> = path.as_os_str().encode_wide().collect();
            wide.push(0);
            wide
        }

        let from_w = to_wide_null(from);
        let to_w = to_wide_null(to);
        let ok = unsafe { MoveFileExW(from_w.as_ptr(), to_w.as_ptr(), MOVEFILE_REPLACE_EXISTING) };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(windows))]
    {
        fs::rename(from, to)
    }
}
