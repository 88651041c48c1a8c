//! Provider registry protocol: the client trait the core depends on, plus
//! the response types shared by every implementation.
//!
//! The resolver and downloader only ever see [`RegistryClient`], which keeps
//! offline testing tractable; the HTTP-backed default lives in [`client`].

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

mod client;

pub use client::HttpRegistryClient;

/// Response from the `…/versions` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderVersions {
    pub versions: Vec<ProviderVersion>,
}

/// A single advertised provider version.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderVersion {
    pub version: String,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub platforms: Vec<ProviderPlatform>,
}

/// A platform published for a provider version.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderPlatform {
    pub os: String,
    pub arch: String,
}

impl fmt::Display for ProviderPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.os, self.arch)
    }
}

/// Response from the `…/download/<os>/<arch>` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadInfo {
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    pub filename: String,
    pub download_url: String,
    #[serde(rename = "shasum")]
    pub sha256: String,
    #[serde(default)]
    pub shasums_url: String,
    #[serde(default)]
    pub shasums_signature_url: String,
}

/// Splits an `os_arch` platform string into its components.
pub fn parse_platform(platform: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = platform.split('_').collect();
    match parts.as_slice() {
        [os, arch] if !os.is_empty() && !arch.is_empty() => {
            Ok(((*os).to_string(), (*arch).to_string()))
        }
        _ => Err(Error::Config(format!(
            "invalid platform format: {platform} (expected os_arch)"
        ))),
    }
}

/// Operations a provider registry exposes. Implementations must map
/// failures onto the error taxonomy: absent providers/versions to
/// [`Error::NotFound`], 429/5xx/network to [`Error::Transient`] (or
/// [`Error::ExhaustedRetries`] once the budget is spent), and unexpected
/// response bodies to [`Error::Protocol`].
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Returns the registry's full version list with per-version platforms.
    async fn get_versions(
        &self,
        cancel: &CancellationToken,
        hostname: &str,
        namespace: &str,
        name: &str,
    ) -> Result<ProviderVersions>;

    /// Returns the archive URL and expected SHA-256 for one artifact.
    #[allow(clippy::too_many_arguments)]
    async fn get_download_info(
        &self,
        cancel: &CancellationToken,
        hostname: &str,
        namespace: &str,
        name: &str,
        version: &str,
        os: &str,
        arch: &str,
    ) -> Result<DownloadInfo>;
}
