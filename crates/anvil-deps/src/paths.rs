use crate::error::Result;
use crate::extract::ExtractOptions;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Folded into every download cache key. Bumping it abandons all previously
/// downloaded files and forces fresh fetches.
pub const DOWNLOAD_FORMAT_VERSION: u32 = 1;

/// Folded into every extraction cache key and flag descriptor. Bumping it
/// forces re-extraction of everything, which is how extraction bug fixes are
/// rolled out to already-populated caches.
pub const EXTRACT_FORMAT_VERSION: u32 = 1;

const DOWNLOAD_KEY_LEN: usize = 10;
const EXTRACT_KEY_LEN: usize = 6;

/// Cache file path for a download: `<cache_root>/<hash10>-<last segment>`.
pub fn target_file_for(cache_root: &Path, url: &str) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(DOWNLOAD_FORMAT_VERSION.to_string().as_bytes());
    let key = truncated_base36(&hasher.finalize(), DOWNLOAD_KEY_LEN);
    cache_root.join(format!("{key}-{}", last_url_segment(url)))
}

/// Cache directory for an extraction: `<cache_root>/<archive name>.<hash6>.d`.
///
/// The archive is keyed by its canonical path plus the option set, so the
/// same archive extracted with different options lands in different
/// directories.
pub fn target_dir_for(cache_root: &Path, archive: &Path, options: ExtractOptions) -> Result<PathBuf> {
    let canonical = std::fs::canonicalize(archive)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    hasher.update(options.descriptor_string().as_bytes());
    let key = truncated_base36(&hasher.finalize(), EXTRACT_KEY_LEN);

    let archive_name = canonical
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());
    Ok(cache_root.join(format!("{archive_name}.{key}.d")))
}

/// Sidecar flag file for an extraction directory: `<dir>.flag`.
pub fn flag_file_for(target_dir: &Path) -> PathBuf {
    let name = target_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "extract".to_string());
    target_dir.with_file_name(format!("{name}.flag"))
}

/// Flag file for an extraction into an explicit, caller-chosen target
/// directory: `<cache_root>/<hash6>-<target name>.flag.txt`.
///
/// Keyed by the target identity rather than the archive identity, so the same
/// target directory always maps to the same flag file no matter which archive
/// is extracted into it.
pub fn flag_file_for_explicit_target(cache_root: &Path, target: &Path) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(target.to_string_lossy().as_bytes());
    let key = truncated_base36(&hasher.finalize(), EXTRACT_KEY_LEN);

    let target_name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "target".to_string());
    cache_root.join(format!("{key}-{target_name}.flag.txt"))
}

fn last_url_segment(url: &str) -> String {
    let without_tail = url
        .split_once(['?', '#'])
        .map(|(head, _)| head)
        .unwrap_or(url);
    let segment = without_tail.rsplit('/').next().unwrap_or("");
    if segment.is_empty() {
        "download".to_string()
    } else {
        segment.to_string()
    }
}

fn truncated_base36(digest: &[u8], len: usize) -> String {
    let mut encoded = to_base36(digest);
    encoded.truncate(len);
    encoded
}

fn to_base36(digest: &[u8]) -> String {
    const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    let mut scratch = digest.to_vec();
    let mut out = Vec::new();
    while scratch.iter().any(|&byte| byte != 0) {
        let mut remainder = 0u32;
        for byte in scratch.iter_mut() {
            let acc = (remainder << 8) | u32::from(*byte);
            *byte = (acc / 36) as u8;
            remainder = acc % 36;
        }
        out.push(ALPHABET[remainder as usize]);
    }
    if out.is_empty() {
        out.push(b'0');
    }
    out.reverse();
    String::from_utf8(out).expect("base36 alphabet is ascii")
}
