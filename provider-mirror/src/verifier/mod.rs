//! Mirror validation against its lock file.
//!
//! The verifier re-opens an existing mirror and checks every archive the
//! lock file names: presence, SHA-256, recomputed `h1:` membership in the
//! version metadata, filename consistency, and index listing. All mismatches
//! accumulate into one result; the mirror is never mutated.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::downloader::checksum::file_sha256;
use crate::error::{Error, Result};
use crate::mirror::{hash::hash_zip, IndexJson, LockFile, VersionJson, LOCK_FILE_NAME};

/// Validates provider mirrors.
pub struct Verifier {
    mirror_dir: PathBuf,
}

/// Accumulated verification outcome.
#[derive(Debug, Default)]
pub struct VerifyResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub provider_count: usize,
    pub version_count: usize,
    pub file_count: usize,
}

impl VerifyResult {
    fn fail(&mut self, message: String) {
        self.valid = false;
        self.errors.push(message);
    }
}

impl Verifier {
    pub fn new(mirror_dir: impl Into<PathBuf>) -> Self {
        Self {
            mirror_dir: mirror_dir.into(),
        }
    }

    /// Validates the mirror. Structural problems land in the result; only
    /// cancellation aborts the walk.
    pub fn verify(&self, cancel: &CancellationToken) -> Result<VerifyResult> {
        let mut result = VerifyResult {
            valid: true,
            ..VerifyResult::default()
        };

        if !self.mirror_dir.is_dir() {
            result.fail("mirror directory does not exist".to_string());
            return Ok(result);
        }

        let lock_path = self.mirror_dir.join(LOCK_FILE_NAME);
        let lock_data = match std::fs::read_to_string(&lock_path) {
            Ok(data) => data,
            Err(e) => {
                result.fail(format!("cannot read {}: {e}", lock_path.display()));
                return Ok(result);
            }
        };

        let lock: LockFile = match serde_json::from_str(&lock_data) {
            Ok(lock) => lock,
            Err(e) => {
                result.fail(format!("invalid {}: {e}", lock_path.display()));
                return Ok(result);
            }
        };

        for provider in &lock.providers {
            result.provider_count += 1;

            let provider_dir = self
                .mirror_dir
                .join(&provider.hostname)
                .join(&provider.namespace)
                .join(&provider.name);

            let index = self.read_index(&provider_dir, &mut result);

            for version in &provider.versions {
                result.version_count += 1;

                if let Some(index) = &index {
                    if !index.versions.contains_key(&version.version) {
                        result.fail(format!(
                            "version {} not in index.json for {}/{}/{}",
                            version.version, provider.hostname, provider.namespace, provider.name
                        ));
                    }
                }

                let meta = self.read_version_meta(&provider_dir, &version.version, &mut result);

                for platform in &version.platforms {
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    result.file_count += 1;

                    let file_path = provider_dir.join(&platform.filename);
                    if !file_path.is_file() {
                        result.fail(format!("missing file: {}", file_path.display()));
                        continue;
                    }

                    match file_sha256(&file_path) {
                        Ok(actual) if actual == platform.sha256 => {}
                        Ok(actual) => {
                            result.fail(format!(
                                "checksum mismatch for {}: expected {}, got {}",
                                file_path.display(),
                                platform.sha256,
                                actual
                            ));
                            continue;
                        }
                        Err(e) => {
                            result.fail(format!("cannot read {}: {e}", file_path.display()));
                            continue;
                        }
                    }

                    let computed_h1 = match hash_zip(&file_path) {
                        Ok(h1) => h1,
                        Err(e) => {
                            result.fail(format!(
                                "cannot compute package hash for {}: {e}",
                                file_path.display()
                            ));
                            continue;
                        }
                    };

                    if let Some(meta) = &meta {
                        let platform_key = format!("{}_{}", platform.os, platform.arch);
                        match meta.archives.get(&platform_key) {
                            None => result.fail(format!(
                                "platform {platform_key} missing from {}.json for {}/{}/{}",
                                version.version,
                                provider.hostname,
                                provider.namespace,
                                provider.name
                            )),
                            Some(archive) => {
                                if archive.url != platform.filename {
                                    result.fail(format!(
                                        "archive url mismatch for {platform_key}: expected {}, got {}",
                                        platform.filename, archive.url
                                    ));
                                }
                                if !contains_hash(&archive.hashes, &computed_h1) {
                                    result.fail(format!(
                                        "package hash {computed_h1} for {} not present in {}.json",
                                        file_path.display(),
                                        version.version
                                    ));
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(result)
    }

    fn read_index(&self, provider_dir: &Path, result: &mut VerifyResult) -> Option<IndexJson> {
        let index_path = provider_dir.join("index.json");
        let data = match std::fs::read_to_string(&index_path) {
            Ok(data) => data,
            Err(e) => {
                result.fail(format!("cannot read {}: {e}", index_path.display()));
                return None;
            }
        };
        match serde_json::from_str(&data) {
            Ok(index) => Some(index),
            Err(e) => {
                result.fail(format!("invalid {}: {e}", index_path.display()));
                None
            }
        }
    }

    fn read_version_meta(
        &self,
        provider_dir: &Path,
        version: &str,
        result: &mut VerifyResult,
    ) -> Option<VersionJson> {
        let meta_path = provider_dir.join(format!("{version}.json"));
        let data = match std::fs::read_to_string(&meta_path) {
            Ok(data) => data,
            Err(e) => {
                result.fail(format!("cannot read {}: {e}", meta_path.display()));
                return None;
            }
        };
        match serde_json::from_str(&data) {
            Ok(meta) => Some(meta),
            Err(e) => {
                result.fail(format!("invalid {}: {e}", meta_path.display()));
                None
            }
        }
    }
}

/// Case-insensitive membership check for `h1:` hash lists.
fn contains_hash(hashes: &[String], wanted: &str) -> bool {
    hashes.iter().any(|h| h.eq_ignore_ascii_case(wanted))
}
