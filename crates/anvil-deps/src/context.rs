use crate::cleanup::{self, SweepReport};
use crate::download;
use crate::error::{DepsError, Result};
use crate::extract::{self, ExtractOptions};
use crate::lock::StripedLocks;
use crate::paths;
use crate::properties;
use crate::retry::RetryPolicy;
use crate::telemetry::{NoopSpanReporter, SpanRecord, SpanReporter};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// File whose presence marks a directory as a usable project root.
pub const PROJECT_MARKER_FILE: &str = "anvil.toml";

/// Pinned dependency versions, relative to the project root.
pub(crate) const DEPENDENCIES_PROPERTIES: &str = "build/dependencies.properties";

const LOCAL_CACHE_DIR: &str = "build/download";

/// What the CI probe learned about the environment.
///
/// Populated by the embedding toolchain's CI detection; [`CiEnvironment::probe`]
/// is the default implementation reading the conventional variables.
#[derive(Clone, Debug, Default)]
pub struct CiEnvironment {
    /// Cache directory that outlives a single build, if the CI system
    /// provides one.
    pub persistent_cache_dir: Option<PathBuf>,
    pub is_ci: bool,
}

impl CiEnvironment {
    pub fn probe() -> Self {
        let persistent_cache_dir =
            std::env::var_os("ANVIL_PERSISTENT_DEPS_CACHE").map(PathBuf::from);
        let is_ci = std::env::var_os("CI")
            .is_some_and(|value| !value.is_empty() && value != "false");
        Self {
            persistent_cache_dir,
            is_ci,
        }
    }

    pub const fn disabled() -> Self {
        Self {
            persistent_cache_dir: None,
            is_ci: false,
        }
    }
}

/// Everything needed to construct a [`DepsContext`].
pub struct DepsConfig {
    pub project_root: PathBuf,
    pub ci: CiEnvironment,
    /// Bypass cache-root resolution entirely; mainly for tests.
    pub cache_root_override: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub telemetry: Arc<dyn SpanReporter>,
}

impl DepsConfig {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            ci: CiEnvironment::disabled(),
            cache_root_override: None,
            retry: RetryPolicy::default(),
            telemetry: Arc::new(NoopSpanReporter),
        }
    }
}

/// The download-and-extraction cache, constructed once per process and shared
/// by reference between build tasks.
///
/// Owns every piece of state the cache needs: the HTTP agent, the resolved
/// cache root, the striped lock pool, the one-shot sweep flag, and the
/// telemetry sink. There is no global state; dropping the context releases
/// everything.
pub struct DepsContext {
    project_root: PathBuf,
    cache_root: PathBuf,
    agent: ureq::Agent,
    locks: StripedLocks,
    retry: RetryPolicy,
    telemetry: Arc<dyn SpanReporter>,
    swept: AtomicBool,
}

impl std::fmt::Debug for DepsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DepsContext")
            .field("project_root", &self.project_root)
            .field("cache_root", &self.cache_root)
            .field("retry", &self.retry)
            .field("swept", &self.swept)
            .finish_non_exhaustive()
    }
}

impl DepsContext {
    pub fn new(config: DepsConfig) -> Result<Self> {
        let project_root = fs::canonicalize(&config.project_root)?;
        if !project_root.join(PROJECT_MARKER_FILE).is_file() {
            return Err(DepsError::MissingMarkerFile {
                path: project_root,
                marker: PROJECT_MARKER_FILE,
            });
        }

        let cache_root = resolve_cache_root(&project_root, &config)?;
        fs::create_dir_all(&cache_root)?;

        let agent = ureq::AgentBuilder::new()
            .redirects(0)
            .user_agent(download::USER_AGENT)
            .build();

        Ok(Self {
            project_root,
            cache_root,
            agent,
            locks: StripedLocks::new(),
            retry: config.retry,
            telemetry: config.telemetry,
            swept: AtomicBool::new(false),
        })
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Read a pinned dependency version from `build/dependencies.properties`.
    pub fn dependency_property(&self, key: &str) -> Result<String> {
        properties::property_from_file(&self.project_root.join(DEPENDENCIES_PROPERTIES), key)
    }

    /// Download `url` into the cache, returning the cached file.
    ///
    /// Subsequent calls for the same URL return the same path without any
    /// network traffic. The bearer token, when given, is only ever sent to
    /// the host of `url` itself.
    pub fn download_to_cache(&self, url: &str, bearer_token: Option<&str>) -> Result<PathBuf> {
        self.sweep_once();
        let started = Instant::now();

        let target = paths::target_file_for(&self.cache_root, url);
        let path = {
            let _guard = self.locks.guard(&target);
            download::fetch(&self.agent, &self.retry, url, bearer_token, &target)?
        };

        self.report_span(
            "deps.download",
            vec![
                ("url", download::sanitize_url(url)),
                ("path", path.display().to_string()),
            ],
            started,
        );
        Ok(path)
    }

    /// Unpack `archive` into a cache directory derived from its identity and
    /// `options`, returning that directory.
    pub fn extract_to_cache(&self, archive: &Path, options: ExtractOptions) -> Result<PathBuf> {
        self.sweep_once();
        let started = Instant::now();

        let target_dir = paths::target_dir_for(&self.cache_root, archive, options)?;
        let flag_file = paths::flag_file_for(&target_dir);
        {
            let _guard = self.locks.guard(&target_dir);
            extract::extract_locked(archive, &target_dir, &flag_file, options)?;
        }

        self.report_span(
            "deps.extract",
            vec![
                ("archive", archive.display().to_string()),
                ("dir", target_dir.display().to_string()),
            ],
            started,
        );
        Ok(target_dir)
    }

    /// Unpack `archive` into an explicit, caller-chosen directory. The flag
    /// file lives in the cache root, keyed by the target identity.
    pub fn extract_to_dir(
        &self,
        archive: &Path,
        target_dir: &Path,
        options: ExtractOptions,
    ) -> Result<()> {
        self.sweep_once();
        let started = Instant::now();

        let flag_file = paths::flag_file_for_explicit_target(&self.cache_root, target_dir);
        {
            let _guard = self.locks.guard(target_dir);
            extract::extract_locked(archive, target_dir, &flag_file, options)?;
        }

        self.report_span(
            "deps.extract_to_dir",
            vec![
                ("archive", archive.display().to_string()),
                ("dir", target_dir.display().to_string()),
            ],
            started,
        );
        Ok(())
    }

    /// Best-effort deletion of cache entries nobody has touched in a month.
    /// Also runs automatically before the first download or extraction of a
    /// context's lifetime.
    pub fn sweep_stale_entries(&self) -> SweepReport {
        cleanup::sweep_stale_entries(&self.cache_root, cleanup::DEFAULT_MAX_AGE)
    }

    fn sweep_once(&self) {
        if self.swept.swap(true, Ordering::SeqCst) {
            return;
        }
        let started = Instant::now();
        let report = self.sweep_stale_entries();
        if report.deleted > 0 || report.failed > 0 {
            tracing::debug!(
                target = "anvil.deps",
                deleted = report.deleted,
                failed = report.failed,
                "swept stale cache entries"
            );
        }
        self.report_span(
            "deps.sweep",
            vec![("deleted", report.deleted.to_string())],
            started,
        );
    }

    fn report_span(
        &self,
        name: &'static str,
        attributes: Vec<(&'static str, String)>,
        started: Instant,
    ) {
        self.telemetry.report(&SpanRecord {
            name,
            attributes,
            elapsed: started.elapsed(),
        });
    }
}

fn resolve_cache_root(project_root: &Path, config: &DepsConfig) -> Result<PathBuf> {
    if let Some(root) = &config.cache_root_override {
        return Ok(root.clone());
    }
    if let Some(dir) = &config.ci.persistent_cache_dir {
        return Ok(dir.clone());
    }
    if config.ci.is_ci {
        // CI machines are wiped between builds; falling back to the
        // project-local directory would silently lose all caching.
        return Err(DepsError::MissingCiPersistentCache);
    }
    Ok(project_root.join(LOCAL_CACHE_DIR))
}
