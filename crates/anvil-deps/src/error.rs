use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, DepsError>;

/// Broad failure classification consulted by the retry layer and by callers.
///
/// Only `Transient` failures are ever retried; `Integrity` and
/// `Configuration` failures surface immediately.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network hiccups, unexpected HTTP statuses, short reads. Worth retrying.
    Transient,
    /// The cache or an archive is in a state that retrying cannot fix.
    Integrity,
    /// The caller or environment is misconfigured.
    Configuration,
}

/// Errors produced by the download-and-extraction cache.
#[derive(Debug, thiserror::Error)]
pub enum DepsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http transport error for {url}: {message}")]
    HttpTransport { url: String, message: String },

    #[error("server returned status {status} for {url} (headers: [{headers}]; body starts with: {body_snippet:?})")]
    HttpStatus {
        status: u16,
        url: String,
        headers: String,
        body_snippet: String,
    },

    #[error("response for {url} has no usable Content-Length header")]
    MissingContentLength { url: String },

    #[error("downloaded {actual} bytes from {url} but Content-Length announced {expected}")]
    ContentLengthMismatch {
        url: String,
        expected: u64,
        actual: u64,
    },

    #[error("too many redirects (> {hops}) while fetching {url}")]
    TooManyRedirects { url: String, hops: usize },

    #[error("redirect response for {url} is missing a Location header")]
    RedirectMissingLocation { url: String },

    #[error("archive {path} is too small to hold a format signature ({len} bytes)")]
    ArchiveTooSmall { path: PathBuf, len: u64 },

    #[error("unknown archive format for {path} (first bytes: {magic:#010x})")]
    UnknownArchiveFormat { path: PathBuf, magic: u32 },

    #[error("unsupported archive entry type for {name:?}")]
    UnsupportedEntryType { name: String },

    #[error("unsafe archive entry name {name:?}: {reason}")]
    UnsafeEntryName { name: String, reason: &'static str },

    #[error("first archive entry {name:?} must be a directory when strip-root is enabled")]
    StripRootNonDirectory { name: String },

    #[error("archive entry {name:?} is not under the top-level directory {root:?}")]
    StripRootMismatch { name: String, root: String },

    #[error("extraction target {path} is not empty after being cleared")]
    TargetDirNotEmpty { path: PathBuf },

    #[error("flag file {path} does not match the descriptor that was just written")]
    FlagSelfCheckMismatch { path: PathBuf },

    #[error("project root {path} is missing the {marker} marker file")]
    MissingMarkerFile { path: PathBuf, marker: &'static str },

    #[error("running under CI but no persistent cache directory was provided")]
    MissingCiPersistentCache,

    #[error("dependency properties file {path} does not exist")]
    MissingPropertiesFile { path: PathBuf },

    #[error("dependency property {key:?} is not defined in {path}")]
    MissingDependencyProperty { key: String, path: PathBuf },

    #[error("invalid url {url:?}: {message}")]
    InvalidUrl { url: String, message: String },
}

impl DepsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DepsError::Io(_)
            | DepsError::HttpTransport { .. }
            | DepsError::HttpStatus { .. }
            | DepsError::MissingContentLength { .. }
            | DepsError::ContentLengthMismatch { .. }
            | DepsError::TooManyRedirects { .. }
            | DepsError::RedirectMissingLocation { .. } => ErrorKind::Transient,

            DepsError::ArchiveTooSmall { .. }
            | DepsError::UnknownArchiveFormat { .. }
            | DepsError::UnsupportedEntryType { .. }
            | DepsError::UnsafeEntryName { .. }
            | DepsError::StripRootNonDirectory { .. }
            | DepsError::StripRootMismatch { .. }
            | DepsError::TargetDirNotEmpty { .. }
            | DepsError::FlagSelfCheckMismatch { .. } => ErrorKind::Integrity,

            DepsError::MissingMarkerFile { .. }
            | DepsError::MissingCiPersistentCache
            | DepsError::MissingPropertiesFile { .. }
            | DepsError::MissingDependencyProperty { .. }
            | DepsError::InvalidUrl { .. } => ErrorKind::Configuration,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}
