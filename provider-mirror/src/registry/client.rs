//! HTTP-backed registry client with service discovery.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::httpclient::{HttpClient, RequestOptions};

use super::{DownloadInfo, ProviderVersions, RegistryClient};

/// Registry client speaking the provider protocol over the shared transport.
///
/// Service discovery (`/.well-known/terraform.json`) runs once per call and
/// is never retried; any discovery failure falls through to the built-in
/// table of default registry hostnames.
pub struct HttpRegistryClient {
    http: Arc<HttpClient>,
}

#[derive(Debug, Deserialize)]
struct ServiceDiscovery {
    #[serde(rename = "providers.v1")]
    providers_v1: Option<String>,
}

impl HttpRegistryClient {
    pub fn new(http: Arc<HttpClient>) -> Self {
        Self { http }
    }

    /// Resolves the `providers.v1` base URL for a hostname.
    async fn discover_service(
        &self,
        cancel: &CancellationToken,
        hostname: &str,
    ) -> Result<String> {
        match self.try_discovery(cancel, hostname).await {
            Ok(base) => Ok(base),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                debug!(hostname, error = %e, "service discovery failed, using fallback table");
                default_service_url(hostname)
            }
        }
    }

    async fn try_discovery(&self, cancel: &CancellationToken, hostname: &str) -> Result<String> {
        let url = format!("https://{hostname}/.well-known/terraform.json");
        let req = self.http.get(&url)?;
        let resp = self.http.execute(req, RequestOptions::new(), cancel).await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Protocol(format!(
                "service discovery returned HTTP {}",
                status.as_u16()
            )));
        }

        let discovery: ServiceDiscovery = resp
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("decoding discovery response: {e}")))?;

        match discovery.providers_v1.as_deref() {
            Some(base) if !base.is_empty() => Ok(resolve_base(hostname, base)),
            _ => Err(Error::Protocol(
                "no providers.v1 endpoint in discovery response".to_string(),
            )),
        }
    }
}

/// Expands a root-relative `providers.v1` value against its hostname and
/// normalizes the trailing slash.
fn resolve_base(hostname: &str, providers_v1: &str) -> String {
    let mut base = if providers_v1.starts_with('/') {
        format!("https://{hostname}{providers_v1}")
    } else {
        providers_v1.to_string()
    };
    if !base.ends_with('/') {
        base.push('/');
    }
    base
}

/// Known provider API URLs for the default registries, used when service
/// discovery is unavailable.
fn default_service_url(hostname: &str) -> Result<String> {
    match hostname {
        "registry.terraform.io" => Ok("https://registry.terraform.io/v1/providers/".to_string()),
        "registry.opentofu.org" => Ok("https://registry.opentofu.org/v1/providers/".to_string()),
        _ => Err(Error::Protocol(format!(
            "unknown registry {hostname} and service discovery failed"
        ))),
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn get_versions(
        &self,
        cancel: &CancellationToken,
        hostname: &str,
        namespace: &str,
        name: &str,
    ) -> Result<ProviderVersions> {
        let base = self.discover_service(cancel, hostname).await?;
        let endpoint = format!("{base}{namespace}/{name}/versions");

        let req = self.http.get(&endpoint)?;
        let resp = self
            .http
            .execute(
                req,
                RequestOptions::new().with_retry().with_auth(hostname),
                cancel,
            )
            .await?;

        let status = resp.status().as_u16();
        if status == 404 {
            return Err(Error::NotFound {
                hostname: hostname.to_string(),
                subject: format!("provider {namespace}/{name}"),
            });
        }
        if status != 200 {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Protocol(format!(
                "registry returned {status}: {}",
                body.trim()
            )));
        }

        resp.json()
            .await
            .map_err(|e| Error::Protocol(format!("decoding versions for {namespace}/{name}: {e}")))
    }

    async fn get_download_info(
        &self,
        cancel: &CancellationToken,
        hostname: &str,
        namespace: &str,
        name: &str,
        version: &str,
        os: &str,
        arch: &str,
    ) -> Result<DownloadInfo> {
        let base = self.discover_service(cancel, hostname).await?;
        let endpoint = format!("{base}{namespace}/{name}/{version}/download/{os}/{arch}");

        let req = self.http.get(&endpoint)?;
        let resp = self
            .http
            .execute(
                req,
                RequestOptions::new().with_retry().with_auth(hostname),
                cancel,
            )
            .await?;

        let status = resp.status().as_u16();
        if status == 404 {
            return Err(Error::NotFound {
                hostname: hostname.to_string(),
                subject: format!("provider {namespace}/{name} version {version} ({os}/{arch})"),
            });
        }
        if status != 200 {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Protocol(format!(
                "registry returned {status}: {}",
                body.trim()
            )));
        }

        resp.json().await.map_err(|e| {
            Error::Protocol(format!(
                "decoding download info for {namespace}/{name} {version}: {e}"
            ))
        })
    }
}
