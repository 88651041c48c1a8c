//! Mirror filesystem writer.
//!
//! The writer stages the whole tree at `<output>.staging`, then removes the
//! old output and renames the staging directory into place. The rename is
//! the single commit point of a build: a failure at any earlier step leaves
//! the existing output untouched. All JSON artifacts are emitted with fully
//! sorted keys and arrays so byte-identical inputs produce byte-identical
//! mirrors (up to the lock file's `generated_at`).

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::downloader::DownloadResult;
use crate::error::{Error, Result};
use crate::resolver::compare_versions_desc;

pub mod hash;

/// Name of the lock file at the mirror root.
pub const LOCK_FILE_NAME: &str = "mirror.lock";

/// Current lock file schema version.
pub const LOCK_SCHEMA_VERSION: u32 = 1;

/// `index.json`: the version list of one provider directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexJson {
    pub versions: BTreeMap<String, IndexEntry>,
}

/// Versions map to empty objects in the consumer layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexEntry {}

/// `<version>.json`: per-platform archive metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionJson {
    pub archives: BTreeMap<String, ArchiveInfo>,
}

/// A single platform archive in the version metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveInfo {
    pub hashes: Vec<String>,
    /// Relative path within the provider directory.
    pub url: String,
}

/// The `mirror.lock` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockFile {
    pub version: u32,
    pub generated_at: String,
    pub providers: Vec<LockProvider>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockProvider {
    pub hostname: String,
    pub namespace: String,
    pub name: String,
    pub versions: Vec<LockVersion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockVersion {
    pub version: String,
    /// Original manifest source specs that contributed this version.
    pub manifest_sources: Vec<String>,
    pub platforms: Vec<LockPlatform>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockPlatform {
    pub os: String,
    pub arch: String,
    pub filename: String,
    /// Archive checksum, as advertised by the registry.
    pub sha256: String,
    /// Content hash over the ZIP entries.
    pub h1: String,
}

/// Writes provider mirrors in the filesystem-mirror layout.
pub struct Writer {
    output_dir: PathBuf,
    staging_dir: PathBuf,
}

impl Writer {
    pub fn new(output_dir: impl Into<PathBuf>) -> Writer {
        // Normalize away trailing separators so the staging suffix lands on
        // the directory name.
        let output_dir: PathBuf = output_dir.into().components().collect();
        let mut staging = output_dir.clone().into_os_string();
        staging.push(".staging");
        Writer {
            output_dir,
            staging_dir: PathBuf::from(staging),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Writes the complete mirror from download results and swaps it into
    /// place.
    pub async fn write(&self, cancel: &CancellationToken, results: Vec<DownloadResult>) -> Result<()> {
        let failures = results.iter().filter(|r| r.error.is_some()).count();
        if failures > 0 {
            return Err(Error::Download { failures });
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let hashes = compute_hashes(cancel, &results).await?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let staging = self.staging_dir.clone();
        let output = self.output_dir.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || write_tree(&staging, &output, &results, &hashes, &cancel))
            .await
            .map_err(|e| Error::Protocol(format!("mirror writer panicked: {e}")))?
    }
}

/// Computes `h1:` hashes for every distinct cached archive, bounded by the
/// number of available CPU cores.
async fn compute_hashes(
    cancel: &CancellationToken,
    results: &[DownloadResult],
) -> Result<BTreeMap<PathBuf, String>> {
    let paths: BTreeSet<PathBuf> = results
        .iter()
        .filter_map(|r| r.cache_path.clone())
        .collect();

    let parallelism = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4);
    let semaphore = Arc::new(Semaphore::new(parallelism));

    debug!(archives = paths.len(), parallelism, "computing package hashes");

    let mut join_set: JoinSet<Result<(PathBuf, String)>> = JoinSet::new();

    for path in paths {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        join_set.spawn(async move {
            let _permit = tokio::select! {
                permit = semaphore.acquire() => permit.expect("semaphore never closes"),
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            };
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let hash_path = path.clone();
            let hashed = tokio::task::spawn_blocking(move || hash::hash_zip(&hash_path))
                .await
                .map_err(|e| Error::Protocol(format!("hash worker panicked: {e}")))??;
            Ok((path, hashed))
        });
    }

    let mut hashes = BTreeMap::new();
    while let Some(joined) = join_set.join_next().await {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let (path, hashed) =
            joined.map_err(|e| Error::Protocol(format!("hash worker panicked: {e}")))??;
        hashes.insert(path, hashed);
    }

    Ok(hashes)
}

type ProviderKey = (String, String, String);

/// Lays out the staging tree and performs the atomic swap. Runs on a
/// blocking thread.
fn write_tree(
    staging: &Path,
    output: &Path,
    results: &[DownloadResult],
    hashes: &BTreeMap<PathBuf, String>,
    cancel: &CancellationToken,
) -> Result<()> {
    if staging.exists() {
        std::fs::remove_dir_all(staging).map_err(|e| Error::io("remove", staging, e))?;
    }

    let mut grouped: BTreeMap<ProviderKey, BTreeMap<String, Vec<&DownloadResult>>> = BTreeMap::new();
    for r in results {
        grouped
            .entry((
                r.task.source.hostname.clone(),
                r.task.source.namespace.clone(),
                r.task.source.name.clone(),
            ))
            .or_default()
            .entry(r.task.version.version.clone())
            .or_default()
            .push(r);
    }

    for ((hostname, namespace, name), versions) in &grouped {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let provider_dir = staging.join(hostname).join(namespace).join(name);
        std::fs::create_dir_all(&provider_dir)
            .map_err(|e| Error::io("create directory", &provider_dir, e))?;

        let mut index = IndexJson::default();

        for (version, downloads) in versions {
            index.versions.insert(version.clone(), IndexEntry::default());

            let mut meta = VersionJson::default();
            for dl in downloads {
                let cache_path = dl.cache_path.as_ref().ok_or_else(|| {
                    Error::Protocol(format!("result for {} has no cached file", dl.task.name()))
                })?;

                let dest = provider_dir.join(&dl.filename);
                std::fs::copy(cache_path, &dest).map_err(|e| Error::io("copy", &dest, e))?;

                let h1 = hashes.get(cache_path).ok_or_else(|| {
                    Error::Protocol(format!("missing package hash for {}", cache_path.display()))
                })?;

                meta.archives.insert(
                    format!("{}_{}", dl.task.os, dl.task.arch),
                    ArchiveInfo {
                        hashes: vec![h1.clone()],
                        url: dl.filename.clone(),
                    },
                );
            }

            write_json(&provider_dir.join(format!("{version}.json")), &meta)?;
        }

        write_json(&provider_dir.join("index.json"), &index)?;
    }

    let lock = build_lock_file(results, hashes)?;
    write_json(&staging.join(LOCK_FILE_NAME), &lock)?;

    // Atomic swap: the rename is the single commit of the whole build.
    if output.exists() {
        std::fs::remove_dir_all(output).map_err(|e| Error::io("remove", output, e))?;
    }
    std::fs::rename(staging, output).map_err(|e| Error::io("rename", output, e))?;

    Ok(())
}

/// Builds the `mirror.lock` document with its deterministic ordering:
/// providers ascending, versions semver-descending, platforms `(os, arch)`
/// ascending, manifest sources ascending.
fn build_lock_file(
    results: &[DownloadResult],
    hashes: &BTreeMap<PathBuf, String>,
) -> Result<LockFile> {
    let mut grouped: BTreeMap<ProviderKey, BTreeMap<String, LockVersion>> = BTreeMap::new();

    for r in results {
        let cache_path = r.cache_path.as_ref().ok_or_else(|| {
            Error::Protocol(format!("result for {} has no cached file", r.task.name()))
        })?;
        let h1 = hashes.get(cache_path).ok_or_else(|| {
            Error::Protocol(format!("missing package hash for {}", cache_path.display()))
        })?;

        let versions = grouped
            .entry((
                r.task.source.hostname.clone(),
                r.task.source.namespace.clone(),
                r.task.source.name.clone(),
            ))
            .or_default();

        let entry = versions
            .entry(r.task.version.version.clone())
            .or_insert_with(|| {
                let mut sources = r.task.version.manifest_sources.clone();
                sources.sort();
                sources.dedup();
                LockVersion {
                    version: r.task.version.version.clone(),
                    manifest_sources: sources,
                    platforms: Vec::new(),
                }
            });

        entry.platforms.push(LockPlatform {
            os: r.task.os.clone(),
            arch: r.task.arch.clone(),
            filename: r.filename.clone(),
            sha256: r.sha256.clone(),
            h1: h1.clone(),
        });
    }

    let mut providers = Vec::with_capacity(grouped.len());
    for ((hostname, namespace, name), versions) in grouped {
        let mut ordered: Vec<LockVersion> = versions.into_values().collect();
        ordered.sort_by(|a, b| compare_versions_desc(&a.version, &b.version));
        for v in &mut ordered {
            v.platforms
                .sort_by(|a, b| a.os.cmp(&b.os).then_with(|| a.arch.cmp(&b.arch)));
        }
        providers.push(LockProvider {
            hostname,
            namespace,
            name,
            versions: ordered,
        });
    }

    Ok(LockFile {
        version: LOCK_SCHEMA_VERSION,
        generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        providers,
    })
}

/// Serializes `value` with two-space indentation and a trailing newline.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut data = serde_json::to_string_pretty(value)
        .map_err(|e| Error::Protocol(format!("serializing {}: {e}", path.display())))?;
    data.push('\n');
    std::fs::write(path, data).map_err(|e| Error::io("write", path, e))
}
