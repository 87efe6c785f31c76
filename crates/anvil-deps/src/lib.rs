//! Download-and-extraction cache for anvil build dependencies.
//!
//! Build tasks ask this crate for remote artifacts (JDKs, libraries,
//! archives) by URL and get back local paths. Artifacts are fetched at most
//! once, unpacked at most once per option set, and shared safely between
//! concurrent build invocations: visible filesystem state only ever changes
//! through atomic renames and flag-file writes, so readers never observe a
//! half-downloaded file or a half-populated directory.
//!
//! ## On-disk layout (inventory)
//!
//! Everything lives flat in the cache root (a CI-provided persistent
//! directory, or `<project_root>/build/download`):
//! - `<hash10>-<file name>`:
//!   - a downloaded artifact, immutable once present
//!   - keyed by SHA-256 of the URL plus [`DOWNLOAD_FORMAT_VERSION`]
//! - `<archive name>.<hash6>.d/` + `<archive name>.<hash6>.d.flag`:
//!   - an exploded archive plus its validity descriptor
//!   - keyed by the archive's canonical path plus the [`ExtractOptions`] set
//! - `<hash6>-<target name>.flag.txt`:
//!   - validity descriptor for an extraction into an explicit target
//!     directory, keyed by the target path
//! - `*.tmp.<pid>.<counter>`:
//!   - in-flight atomic writes; stale ones are removed by the sweeper
//!
//! Entry mtimes double as recency markers: cache hits refresh them and the
//! stale-entry sweeper deletes whatever has not been touched in a month.
//!
//! All entry points live on [`DepsContext`], constructed once per process
//! from a [`DepsConfig`].

mod cleanup;
mod context;
mod download;
mod error;
mod extract;
mod lock;
mod paths;
mod properties;
mod retry;
mod telemetry;
mod util;

pub use cleanup::SweepReport;
pub use context::{CiEnvironment, DepsConfig, DepsContext, PROJECT_MARKER_FILE};
pub use error::{DepsError, ErrorKind, Result};
pub use extract::ExtractOptions;
pub use paths::{
    flag_file_for, flag_file_for_explicit_target, target_dir_for, target_file_for,
    DOWNLOAD_FORMAT_VERSION, EXTRACT_FORMAT_VERSION,
};
pub use retry::RetryPolicy;
pub use telemetry::{NoopSpanReporter, SpanRecord, SpanReporter};
