//! A minimal reader for Java `.properties` files.
//!
//! Pinned dependency versions live in `build/dependencies.properties` under
//! the project root. Only the subset of the format that file actually uses is
//! supported: `#`/`!` comments, `key=value` and `key: value` separators,
//! whitespace trimming. Backslash line continuations are not.

use crate::error::{DepsError, Result};
use std::path::Path;

/// Look up `key` in the properties file at `path`.
pub(crate) fn property_from_file(path: &Path, key: &str) -> Result<String> {
    if !path.is_file() {
        return Err(DepsError::MissingPropertiesFile {
            path: path.to_path_buf(),
        });
    }
    let text = std::fs::read_to_string(path)?;
    lookup(&text, key).ok_or_else(|| DepsError::MissingDependencyProperty {
        key: key.to_string(),
        path: path.to_path_buf(),
    })
}

fn lookup(text: &str, key: &str) -> Option<String> {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let Some(separator) = line.find(['=', ':']) else {
            continue;
        };
        let (candidate, value) = line.split_at(separator);
        if candidate.trim() == key {
            return Some(value[1..].trim().to_string());
        }
    }
    None
}
