use crate::error::Result;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Derive a colocated temp path for `dest`: `<dest>.tmp.<pid>.<counter>`.
///
/// Colocated means same parent directory, which keeps the final rename on a
/// single filesystem and therefore atomic.
pub(crate) fn unique_tmp_path(dest: &Path) -> io::Result<PathBuf> {
    let file_name = dest
        .file_name()
        .ok_or_else(|| io::Error::other("destination path has no file name"))?;
    let pid = std::process::id();
    let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(format!(".tmp.{pid}.{counter}"));
    Ok(dest.with_file_name(tmp_name))
}

/// Publish `tmp_path` as `dest` via rename, replacing any existing file.
///
/// On Windows `rename` does not overwrite; concurrent writers racing through
/// `remove + rename` retry until one of them wins. The temp file is removed
/// if the rename ultimately fails.
pub(crate) fn rename_replace(tmp_path: &Path, dest: &Path) -> io::Result<()> {
    const MAX_RENAME_ATTEMPTS: usize = 1024;

    let rename_result = (|| -> io::Result<()> {
        let mut attempts = 0usize;
        loop {
            match fs::rename(tmp_path, dest) {
                Ok(()) => return Ok(()),
                Err(err)
                    if cfg!(windows)
                        && (err.kind() == io::ErrorKind::AlreadyExists || dest.exists()) =>
                {
                    match fs::remove_file(dest) {
                        Ok(()) => {}
                        Err(remove_err) if remove_err.kind() == io::ErrorKind::NotFound => {}
                        Err(remove_err) => return Err(remove_err),
                    }

                    attempts += 1;
                    if attempts >= MAX_RENAME_ATTEMPTS {
                        return Err(err);
                    }
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    })();

    match rename_result {
        Ok(()) => {
            if let Some(parent) = dest.parent() {
                sync_dir_best_effort(parent);
            }
            Ok(())
        }
        Err(err) => {
            remove_file_best_effort(tmp_path, "rename_replace.cleanup_tmp");
            Err(err)
        }
    }
}

/// Write `bytes` to `path` atomically: unique temp sibling, fsync, rename.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Err(io::Error::other("path has no parent").into());
    };
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };
    fs::create_dir_all(parent)?;

    let tmp_path = unique_tmp_path(path)?;
    let write_result = (|| -> io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(())
    })();
    if let Err(err) = write_result {
        remove_file_best_effort(&tmp_path, "atomic_write.cleanup_tmp");
        return Err(err.into());
    }

    rename_replace(&tmp_path, path)?;
    Ok(())
}

pub(crate) fn remove_file_best_effort(path: &Path, reason: &'static str) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            tracing::debug!(
                target = "anvil.deps",
                path = %path.display(),
                reason,
                error = %err,
                "failed to remove file"
            );
            false
        }
    }
}

/// Refresh the modification time of a cache entry (file or directory).
///
/// The external sweeper evicts by recency, so cache hits bump mtimes to keep
/// live entries around. Failure only makes eviction slightly too eager.
pub(crate) fn touch_best_effort(path: &Path) {
    let result = fs::File::open(path).and_then(|file| file.set_modified(SystemTime::now()));
    if let Err(err) = result {
        tracing::debug!(
            target = "anvil.deps",
            path = %path.display(),
            error = %err,
            "failed to refresh cache entry mtime"
        );
    }
}

pub(crate) fn sync_dir_best_effort(dir: &Path) {
    #[cfg(unix)]
    {
        match fs::File::open(dir).and_then(|dir| dir.sync_all()) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::debug!(
                    target = "anvil.deps",
                    dir = %dir.display(),
                    error = %err,
                    "failed to sync directory (best effort)"
                );
            }
        }
    }

    #[cfg(not(unix))]
    let _ = dir;
}
