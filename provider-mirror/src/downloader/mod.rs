//! Concurrent provider archive downloader with a content-addressed cache.
//!
//! Tasks run under a bounded semaphore and observe cancellation at every
//! suspension point: before and after acquiring a slot, during HTTP body
//! reads, and during backoff sleeps. Archives stream through a SHA-256
//! hasher into a `.tmp` sibling of their cache path; the rename to the final
//! path is the commit point, so concurrent readers never observe partial
//! files. A checksum mismatch is data corruption, not a transient failure,
//! and is never retried.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::httpclient::{
    backoff, parse_retry_after, sleep_cancellable, status_error, HttpClient, RequestOptions,
};
use crate::manifest::ProviderSource;
use crate::progress::{NoopProgress, ProgressObserver};
use crate::registry::{parse_platform, RegistryClient};
use crate::resolver::{Resolution, ResolvedVersion};

pub mod checksum;

/// Timeout budget for a single archive GET, body included.
const ARCHIVE_TIMEOUT: Duration = Duration::from_secs(300);

/// Configures the downloader behavior.
#[derive(Debug, Clone)]
pub struct Config {
    pub cache_dir: PathBuf,
    pub no_cache: bool,
    pub concurrency: usize,
    pub retries: u32,
    pub max_backoff: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("provider-mirror-cache"),
            no_cache: false,
            concurrency: 8,
            retries: 3,
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// A single archive to fetch, derived structurally from the resolution.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub source: ProviderSource,
    pub version: ResolvedVersion,
    pub platform: String,
    pub os: String,
    pub arch: String,
}

impl DownloadTask {
    /// Human-readable task name for logs and progress bars.
    pub fn name(&self) -> String {
        format!(
            "{}/{}@{} {}",
            self.source.namespace, self.source.name, self.version.version, self.platform
        )
    }
}

/// Outcome of one download task. Exactly one of `error` and `cache_path` is
/// populated.
#[derive(Debug)]
pub struct DownloadResult {
    pub task: DownloadTask,
    pub cache_path: Option<PathBuf>,
    pub download_url: String,
    pub filename: String,
    pub sha256: String,
    pub error: Option<Arc<Error>>,
    pub from_cache: bool,
}

impl DownloadResult {
    fn pending(task: DownloadTask) -> Self {
        Self {
            task,
            cache_path: None,
            download_url: String::new(),
            filename: String::new(),
            sha256: String::new(),
            error: None,
            from_cache: false,
        }
    }

    fn failed(task: DownloadTask, error: Error) -> Self {
        let mut result = Self::pending(task);
        result.error = Some(Arc::new(error));
        result
    }
}

/// Downloads provider archives for a resolution.
pub struct Downloader {
    worker: Arc<Worker>,
}

struct Worker {
    config: Config,
    client: Arc<dyn RegistryClient>,
    http: Arc<HttpClient>,
    progress: Arc<dyn ProgressObserver>,
}

impl Downloader {
    pub fn new(config: Config, client: Arc<dyn RegistryClient>, http: Arc<HttpClient>) -> Self {
        Self {
            worker: Arc::new(Worker {
                config,
                client,
                http,
                progress: Arc::new(NoopProgress),
            }),
        }
    }

    /// Attaches a progress observer. Display-only; the downloader never
    /// waits on it.
    pub fn with_progress(mut self, progress: Arc<dyn ProgressObserver>) -> Self {
        let worker = Arc::get_mut(&mut self.worker)
            .expect("with_progress must be called before download starts");
        worker.progress = progress;
        self
    }

    /// Flattens a resolution into its download tasks.
    pub fn tasks(resolution: &Resolution) -> Result<Vec<DownloadTask>> {
        let mut tasks = Vec::new();
        for provider in &resolution.providers {
            for version in &provider.versions {
                for platform in &version.platforms {
                    let (os, arch) = parse_platform(platform)?;
                    tasks.push(DownloadTask {
                        source: provider.source.clone(),
                        version: version.clone(),
                        platform: platform.clone(),
                        os,
                        arch,
                    });
                }
            }
        }
        Ok(tasks)
    }

    /// Downloads every archive in the resolution.
    ///
    /// Individual task failures land in the corresponding slot of the result
    /// vector; the second element is the first non-cancellation error in
    /// task order. `Err` is reserved for infrastructure failures (cache
    /// directory creation, task bookkeeping).
    pub async fn download(
        &self,
        cancel: &CancellationToken,
        resolution: &Resolution,
    ) -> Result<(Vec<DownloadResult>, Option<Arc<Error>>)> {
        tokio::fs::create_dir_all(&self.worker.config.cache_dir)
            .await
            .map_err(|e| Error::io("create directory", &self.worker.config.cache_dir, e))?;

        let tasks = Self::tasks(resolution)?;
        let total = tasks.len();

        debug!(
            total_tasks = total,
            concurrency = self.worker.config.concurrency,
            cache_dir = %self.worker.config.cache_dir.display(),
            no_cache = self.worker.config.no_cache,
            "starting downloads"
        );

        self.worker.progress.add_total_bar(total as u64);

        let semaphore = Arc::new(Semaphore::new(self.worker.config.concurrency.max(1)));
        let mut join_set: JoinSet<(usize, DownloadResult)> = JoinSet::new();

        for (idx, task) in tasks.into_iter().enumerate() {
            let worker = Arc::clone(&self.worker);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();

            join_set.spawn(async move {
                let result = worker.run_task(task, &cancel, &semaphore).await;
                worker.progress.step_total();
                (idx, result)
            });
        }

        // Pre-sized slot array indexed by task position; each task owns its
        // slot, so completion order does not matter.
        let mut slots: Vec<Option<DownloadResult>> = Vec::with_capacity(total);
        slots.resize_with(total, || None);

        while let Some(joined) = join_set.join_next().await {
            let (idx, result) =
                joined.map_err(|e| Error::Protocol(format!("download task panicked: {e}")))?;
            slots[idx] = Some(result);
        }

        let results: Vec<DownloadResult> = slots
            .into_iter()
            .map(|slot| slot.expect("every task fills its slot"))
            .collect();

        let first_error = results
            .iter()
            .filter_map(|r| r.error.clone())
            .find(|e| !e.is_cancelled());

        Ok((results, first_error))
    }
}

impl Worker {
    async fn run_task(
        &self,
        task: DownloadTask,
        cancel: &CancellationToken,
        semaphore: &Semaphore,
    ) -> DownloadResult {
        // Checked before taking a slot and again right after: a cancelled
        // build should not start new transfers.
        if cancel.is_cancelled() {
            return DownloadResult::failed(task, Error::Cancelled);
        }

        let _permit = tokio::select! {
            permit = semaphore.acquire() => permit.expect("semaphore never closes"),
            _ = cancel.cancelled() => return DownloadResult::failed(task, Error::Cancelled),
        };

        if cancel.is_cancelled() {
            return DownloadResult::failed(task, Error::Cancelled);
        }

        self.download_task(cancel, task).await
    }

    async fn download_task(&self, cancel: &CancellationToken, task: DownloadTask) -> DownloadResult {
        debug!(
            hostname = %task.source.hostname,
            provider = %format!("{}/{}", task.source.namespace, task.source.name),
            version = %task.version.version,
            platform = %task.platform,
            "fetching download info"
        );

        let info = match self
            .client
            .get_download_info(
                cancel,
                &task.source.hostname,
                &task.source.namespace,
                &task.source.name,
                &task.version.version,
                &task.os,
                &task.arch,
            )
            .await
        {
            Ok(info) => info,
            Err(e) => return DownloadResult::failed(task, e),
        };

        let cache_path = self.cache_path(&task, &info.filename);
        let name = task.name();

        let mut result = DownloadResult {
            task,
            cache_path: None,
            download_url: info.download_url.clone(),
            filename: info.filename.clone(),
            sha256: info.sha256.clone(),
            error: None,
            from_cache: false,
        };

        if !self.config.no_cache && self.check_cache(&cache_path, &info.sha256).await {
            debug!(path = %cache_path.display(), "cache hit");
            result.cache_path = Some(cache_path);
            result.from_cache = true;
            return result;
        }

        debug!(url = %info.download_url, dest = %cache_path.display(), "cache miss, downloading");

        match self
            .download_with_retry(cancel, &info.download_url, &cache_path, &info.sha256, &name)
            .await
        {
            Ok(()) => result.cache_path = Some(cache_path),
            Err(e) => result.error = Some(Arc::new(e)),
        }

        result
    }

    /// Cache layout: `<root>/<hostname>/<namespace>/<name>/<version>/<os_arch>/<filename>`.
    fn cache_path(&self, task: &DownloadTask, filename: &str) -> PathBuf {
        self.config
            .cache_dir
            .join(&task.source.hostname)
            .join(&task.source.namespace)
            .join(&task.source.name)
            .join(&task.version.version)
            .join(&task.platform)
            .join(filename)
    }

    /// True if the cached file exists and hashes to the expected SHA-256.
    async fn check_cache(&self, path: &Path, expected: &str) -> bool {
        if !path.is_file() {
            return false;
        }
        let path = path.to_path_buf();
        let hashed = tokio::task::spawn_blocking(move || checksum::file_sha256(&path)).await;
        matches!(hashed, Ok(Ok(actual)) if actual == expected)
    }

    async fn download_with_retry(
        &self,
        cancel: &CancellationToken,
        url: &str,
        dest: &Path,
        expected_sha256: &str,
        name: &str,
    ) -> Result<()> {
        let mut last_err: Option<Error> = None;

        for attempt in 0..=self.config.retries {
            if attempt > 0 {
                let wait = backoff(
                    attempt,
                    self.config.max_backoff,
                    last_err.as_ref().and_then(Error::retry_after),
                );
                debug!(
                    attempt = attempt + 1,
                    max_attempts = self.config.retries + 1,
                    backoff_ms = wait.as_millis() as u64,
                    url,
                    "retrying download"
                );
                sleep_cancellable(wait, cancel).await?;
            }

            match self
                .download_file(cancel, url, dest, expected_sha256, name)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(Error::ExhaustedRetries {
            attempts: self.config.retries + 1,
            source: Box::new(last_err.expect("retry loop always records a transient error")),
        })
    }

    /// Streams one archive to `<dest>.tmp`, hashing as it writes, then
    /// renames over `dest`. The rename is the commit point.
    async fn download_file(
        &self,
        cancel: &CancellationToken,
        url: &str,
        dest: &Path,
        expected_sha256: &str,
        name: &str,
    ) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io("create directory", parent, e))?;
        }

        let request = self.http.get(url)?;
        let resp = self
            .http
            .execute(
                request,
                RequestOptions::new().with_timeout(ARCHIVE_TIMEOUT),
                cancel,
            )
            .await?;

        let status = resp.status().as_u16();
        if status != 200 {
            let retry_after = parse_retry_after(
                resp.headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok()),
            );
            return Err(status_error(status, retry_after));
        }

        let tmp_path = tmp_sibling(dest);
        let size = resp.content_length().unwrap_or(0);
        let bar = self.progress.add_file_bar(name, size);

        let mut file = match tokio::fs::File::create(&tmp_path).await {
            Ok(file) => file,
            Err(e) => {
                bar.abandon();
                return Err(Error::io("create", &tmp_path, e));
            }
        };

        let mut hasher = Sha256::new();
        let mut stream = resp.bytes_stream();

        let streamed: Result<()> = loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancel.cancelled() => break Err(Error::Cancelled),
            };

            match chunk {
                None => break Ok(()),
                Some(Err(e)) => {
                    break Err(Error::Transient {
                        message: format!("reading {url}: {e}"),
                        status: None,
                        retry_after: None,
                    })
                }
                Some(Ok(bytes)) => {
                    if let Err(e) = file.write_all(&bytes).await {
                        break Err(Error::io("write", &tmp_path, e));
                    }
                    hasher.update(&bytes);
                    bar.step(bytes.len() as u64);
                }
            }
        };

        if let Err(e) = streamed {
            bar.abandon();
            drop(file);
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        let actual = hex::encode(hasher.finalize());
        if actual != expected_sha256 {
            bar.abandon();
            drop(file);
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(Error::Integrity {
                file: dest
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| dest.display().to_string()),
                expected: expected_sha256.to_string(),
                actual,
            });
        }

        if let Err(e) = flush_and_sync(&mut file).await {
            bar.abandon();
            drop(file);
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(Error::io("sync", &tmp_path, e));
        }
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp_path, dest).await {
            bar.abandon();
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(Error::io("rename", dest, e));
        }

        bar.finish();
        Ok(())
    }
}

async fn flush_and_sync(file: &mut tokio::fs::File) -> std::io::Result<()> {
    file.flush().await?;
    file.sync_all().await
}

fn tmp_sibling(dest: &Path) -> PathBuf {
    let mut os: OsString = dest.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}
