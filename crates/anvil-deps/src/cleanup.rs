use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Entries untouched for this long are eligible for deletion. Cache hits
/// refresh entry mtimes, so anything older has not been asked for in a month.
pub(crate) const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Outcome of a stale-entry sweep. Failures are already logged; they are
/// reported here only so callers can surface a summary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: usize,
    pub failed: usize,
}

/// Delete cache entries whose mtime is older than `max_age`.
///
/// Best effort throughout: every failure is logged as a warning and skipped,
/// never propagated. Flag files are deleted together with the directory they
/// describe.
pub(crate) fn sweep_stale_entries(cache_root: &Path, max_age: Duration) -> SweepReport {
    let mut report = SweepReport::default();
    let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
        return report;
    };

    let entries = match fs::read_dir(cache_root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return report,
        Err(err) => {
            tracing::warn!(
                target = "anvil.deps",
                cache_root = %cache_root.display(),
                error = %err,
                "failed to read cache root while sweeping"
            );
            report.failed += 1;
            return report;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(
                    target = "anvil.deps",
                    cache_root = %cache_root.display(),
                    error = %err,
                    "failed to read cache entry while sweeping"
                );
                report.failed += 1;
                continue;
            }
        };
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();

        // A flag's lifetime is tied to its directory; it is removed in the
        // same step as the directory and never judged on its own mtime.
        if name.ends_with(".d.flag") {
            let dir = path.with_file_name(name.trim_end_matches(".flag").to_string());
            if dir.is_dir() {
                continue;
            }
        }

        let Some(modified) = modified_time(&path) else {
            continue;
        };
        if modified >= cutoff {
            continue;
        }

        match delete_entry(&path) {
            Ok(()) => {
                report.deleted += 1;
                if path.extension().is_some_and(|ext| ext == "d") {
                    let flag = path.with_file_name(format!("{name}.flag"));
                    if flag.is_file() && delete_entry(&flag).is_ok() {
                        report.deleted += 1;
                    }
                }
                tracing::debug!(
                    target = "anvil.deps",
                    path = %path.display(),
                    "swept stale cache entry"
                );
            }
            Err(err) => {
                tracing::warn!(
                    target = "anvil.deps",
                    path = %path.display(),
                    error = %err,
                    "failed to sweep stale cache entry"
                );
                report.failed += 1;
            }
        }
    }

    report
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) => {
            // Entries can race with concurrent deletion; only log surprises.
            if err.kind() != io::ErrorKind::NotFound {
                tracing::debug!(
                    target = "anvil.deps",
                    path = %path.display(),
                    error = %err,
                    "failed to stat cache entry while sweeping"
                );
            }
            return None;
        }
    };
    meta.modified().ok()
}

fn delete_entry(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if meta.is_dir() {
        remove_dir_all_nofollow(path)
    } else {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn remove_dir_all_nofollow(path: &Path) -> io::Result<()> {
    for entry in walkdir::WalkDir::new(path)
        .follow_links(false)
        .contents_first(true)
    {
        let entry = entry.map_err(io::Error::other)?;
        if entry.file_type().is_dir() {
            fs::remove_dir(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
