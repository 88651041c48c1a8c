//! Build orchestration: load, resolve, download, write.
//!
//! The builder owns the collaborators and sequences the phases, checking the
//! cancellation token at every phase boundary so an interrupted build never
//! writes partial output. Collaborators are constructed explicitly here and
//! passed down; there is no ambient state beyond the tracing dispatcher.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::downloader::{self, Downloader};
use crate::error::{Error, Result};
use crate::httpclient::{self, HttpClient};
use crate::manifest::Manifest;
use crate::mirror::Writer;
use crate::progress::{NoopProgress, ProgressObserver};
use crate::registry::{HttpRegistryClient, RegistryClient};
use crate::resolver::Resolver;

/// Configuration for a mirror build.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub manifest_path: PathBuf,
    pub output_dir: PathBuf,
    /// `None` means the default per-user temp cache.
    pub cache_dir: Option<PathBuf>,
    pub no_cache: bool,
    pub concurrency: usize,
    pub retries: u32,
    pub max_backoff: Duration,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            manifest_path: PathBuf::from("mirror.yaml"),
            output_dir: PathBuf::from("./mirror"),
            cache_dir: None,
            no_cache: false,
            concurrency: 8,
            retries: 3,
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Counters reported after a successful build.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildSummary {
    pub providers: usize,
    pub versions: usize,
    pub files: usize,
    pub downloaded: usize,
    pub from_cache: usize,
}

/// Wires the manifest, resolver, downloader, and writer into one build.
pub struct Builder {
    config: BuildConfig,
    manifest: Manifest,
    client: Arc<dyn RegistryClient>,
    http: Arc<HttpClient>,
    progress: Arc<dyn ProgressObserver>,
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("config", &self.config)
            .field("manifest", &self.manifest)
            .finish_non_exhaustive()
    }
}

impl Builder {
    /// Loads the manifest and constructs the default collaborators.
    pub fn new(config: BuildConfig) -> Result<Self> {
        let manifest = Manifest::load(&config.manifest_path)?;

        let http = Arc::new(HttpClient::new(httpclient::Config {
            retries: config.retries,
            max_backoff: config.max_backoff,
            ..httpclient::Config::default()
        })?);
        let client: Arc<dyn RegistryClient> = Arc::new(HttpRegistryClient::new(Arc::clone(&http)));

        Ok(Self {
            config,
            manifest,
            client,
            http,
            progress: Arc::new(NoopProgress),
        })
    }

    /// Swaps in a different registry client (offline tests).
    pub fn with_registry(mut self, client: Arc<dyn RegistryClient>) -> Self {
        self.client = client;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressObserver>) -> Self {
        self.progress = progress;
        self
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Executes the complete build.
    pub async fn build(&self, cancel: &CancellationToken) -> Result<BuildSummary> {
        info!(
            manifest = %self.config.manifest_path.display(),
            output = %self.config.output_dir.display(),
            providers = self.manifest.providers.len(),
            "starting mirror build"
        );

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Phase 1: resolve constraints to concrete versions.
        let resolve_start = Instant::now();
        let resolution = Resolver::new(Arc::clone(&self.client))
            .resolve(cancel, &self.manifest)
            .await?;

        let mut summary = BuildSummary {
            providers: resolution.providers.len(),
            ..BuildSummary::default()
        };
        for p in &resolution.providers {
            summary.versions += p.versions.len();
            for v in &p.versions {
                summary.files += v.platforms.len();
            }
        }

        info!(
            providers = summary.providers,
            versions = summary.versions,
            downloads = summary.files,
            duration_ms = resolve_start.elapsed().as_millis() as u64,
            "version resolution complete"
        );

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Phase 2: download archives.
        let download_start = Instant::now();
        let downloader = Downloader::new(
            downloader::Config {
                cache_dir: self
                    .config
                    .cache_dir
                    .clone()
                    .unwrap_or_else(|| downloader::Config::default().cache_dir),
                no_cache: self.config.no_cache,
                concurrency: self.config.concurrency,
                retries: self.config.retries,
                max_backoff: self.config.max_backoff,
            },
            Arc::clone(&self.client),
            Arc::clone(&self.http),
        )
        .with_progress(Arc::clone(&self.progress));

        let (results, first_error) = downloader.download(cancel, &resolution).await?;

        let mut failures = 0usize;
        for r in &results {
            match &r.error {
                Some(e) if !e.is_cancelled() => {
                    failures += 1;
                    error!(
                        provider = %r.task.source,
                        version = %r.task.version.version,
                        platform = %r.task.platform,
                        error = %e,
                        "download failed"
                    );
                }
                Some(_) => {}
                None if r.from_cache => summary.from_cache += 1,
                None => summary.downloaded += 1,
            }
        }

        // A cancelled build reports one cancellation, not the cascade of
        // per-task errors it caused.
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if failures > 0 {
            if let Some(cause) = first_error {
                error!(error = %cause, "first failure");
            }
            return Err(Error::Download { failures });
        }

        info!(
            downloaded = summary.downloaded,
            cache_hits = summary.from_cache,
            total = results.len(),
            duration_ms = download_start.elapsed().as_millis() as u64,
            "downloads complete"
        );

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Phase 3: write the mirror and swap it into place.
        let write_start = Instant::now();
        Writer::new(&self.config.output_dir)
            .write(cancel, results)
            .await?;

        info!(
            duration_ms = write_start.elapsed().as_millis() as u64,
            "mirror written"
        );

        info!(
            providers = summary.providers,
            versions = summary.versions,
            files = summary.files,
            total_duration_ms = resolve_start.elapsed().as_millis() as u64,
            "build complete"
        );

        Ok(summary)
    }
}
