//! Shared fixtures for integration tests: a scripted HTTP stub server, an
//! in-memory registry, and ZIP fixture helpers.

// Each integration test binary compiles this module and uses a subset of it.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use provider_mirror::error::{Error, Result};
use provider_mirror::registry::{
    DownloadInfo, ProviderPlatform, ProviderVersion, ProviderVersions, RegistryClient,
};

/// A scripted HTTP response.
#[derive(Debug, Clone)]
pub struct StubResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl StubResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

#[derive(Debug, Default)]
struct Route {
    /// Responses served in order; the last one repeats.
    responses: Vec<StubResponse>,
    served: usize,
    hits: usize,
    last_request_headers: Vec<String>,
}

/// Minimal HTTP/1.1 server serving scripted responses, for exercising the
/// real network path without leaving the host.
pub struct StubServer {
    addr: SocketAddr,
    routes: Arc<Mutex<HashMap<String, Route>>>,
}

impl StubServer {
    pub async fn start() -> StubServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub server");
        let addr = listener.local_addr().expect("stub server addr");
        let routes: Arc<Mutex<HashMap<String, Route>>> = Arc::new(Mutex::new(HashMap::new()));

        let accept_routes = Arc::clone(&routes);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let routes = Arc::clone(&accept_routes);
                tokio::spawn(async move {
                    let _ = serve_connection(stream, routes).await;
                });
            }
        });

        StubServer { addr, routes }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Queues one response for `path`. Responses are served in order; the
    /// last queued response repeats for any further requests.
    pub fn enqueue(&self, path: &str, response: StubResponse) {
        self.routes
            .lock()
            .expect("stub routes lock")
            .entry(path.to_string())
            .or_default()
            .responses
            .push(response);
    }

    /// Number of requests served for `path`.
    pub fn hits(&self, path: &str) -> usize {
        self.routes
            .lock()
            .expect("stub routes lock")
            .get(path)
            .map(|r| r.hits)
            .unwrap_or(0)
    }

    /// Raw header lines of the most recent request for `path`.
    pub fn last_request_headers(&self, path: &str) -> Vec<String> {
        self.routes
            .lock()
            .expect("stub routes lock")
            .get(path)
            .map(|r| r.last_request_headers.clone())
            .unwrap_or_default()
    }
}

async fn serve_connection(
    mut stream: tokio::net::TcpStream,
    routes: Arc<Mutex<HashMap<String, Route>>>,
) -> std::io::Result<()> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    while !buffer.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buffer.extend_from_slice(&chunk[..n]);
        if buffer.len() > 64 * 1024 {
            return Ok(());
        }
    }

    let head = String::from_utf8_lossy(&buffer);
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let path = request_line.split_whitespace().nth(1).unwrap_or("/").to_string();
    let headers: Vec<String> = lines
        .take_while(|l| !l.is_empty())
        .map(str::to_string)
        .collect();

    let response = {
        let mut routes = routes.lock().expect("stub routes lock");
        match routes.get_mut(&path) {
            Some(route) => {
                route.hits += 1;
                route.last_request_headers = headers;
                let idx = route.served.min(route.responses.len().saturating_sub(1));
                route.served += 1;
                route.responses.get(idx).cloned()
            }
            None => None,
        }
    };

    let response = response.unwrap_or_else(|| StubResponse::status(404));

    let mut out = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        reason_phrase(response.status),
        response.body.len()
    );
    for (name, value) in &response.headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");

    stream.write_all(out.as_bytes()).await?;
    stream.write_all(&response.body).await?;
    stream.shutdown().await
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Response",
    }
}

/// Builds an in-memory ZIP archive with the given entries.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, content) in entries {
        writer
            .start_file(*name, zip::write::SimpleFileOptions::default())
            .expect("zip entry");
        writer.write_all(content).expect("zip content");
    }
    writer.finish().expect("finish zip").into_inner()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[derive(Debug, Clone)]
struct ArchiveSpec {
    filename: String,
    download_url: String,
    sha256: String,
}

type ProviderKey = (String, String, String);
type ArchiveKey = (String, String, String, String, String);

/// In-memory registry backed by explicit fixtures. Download URLs typically
/// point at a [`StubServer`].
#[derive(Debug, Default)]
pub struct TestRegistry {
    listings: HashMap<ProviderKey, Vec<ProviderVersion>>,
    archives: HashMap<ArchiveKey, ArchiveSpec>,
}

impl TestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_provider(
        &mut self,
        hostname: &str,
        namespace: &str,
        name: &str,
        versions: &[(&str, &[&str])],
    ) {
        let entries = versions
            .iter()
            .map(|(version, platforms)| ProviderVersion {
                version: (*version).to_string(),
                protocols: vec![],
                platforms: platforms
                    .iter()
                    .map(|p| {
                        let (os, arch) = p.split_once('_').expect("os_arch fixture");
                        ProviderPlatform {
                            os: os.to_string(),
                            arch: arch.to_string(),
                        }
                    })
                    .collect(),
            })
            .collect();
        self.listings.insert(
            (
                hostname.to_string(),
                namespace.to_string(),
                name.to_string(),
            ),
            entries,
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_archive(
        &mut self,
        hostname: &str,
        namespace: &str,
        name: &str,
        version: &str,
        platform: &str,
        filename: &str,
        download_url: &str,
        sha256: &str,
    ) {
        self.archives.insert(
            (
                hostname.to_string(),
                namespace.to_string(),
                name.to_string(),
                version.to_string(),
                platform.to_string(),
            ),
            ArchiveSpec {
                filename: filename.to_string(),
                download_url: download_url.to_string(),
                sha256: sha256.to_string(),
            },
        );
    }
}

#[async_trait]
impl RegistryClient for TestRegistry {
    async fn get_versions(
        &self,
        _cancel: &CancellationToken,
        hostname: &str,
        namespace: &str,
        name: &str,
    ) -> Result<ProviderVersions> {
        match self.listings.get(&(
            hostname.to_string(),
            namespace.to_string(),
            name.to_string(),
        )) {
            Some(versions) => Ok(ProviderVersions {
                versions: versions.clone(),
            }),
            None => Err(Error::NotFound {
                hostname: hostname.to_string(),
                subject: format!("provider {namespace}/{name}"),
            }),
        }
    }

    async fn get_download_info(
        &self,
        _cancel: &CancellationToken,
        hostname: &str,
        namespace: &str,
        name: &str,
        version: &str,
        os: &str,
        arch: &str,
    ) -> Result<DownloadInfo> {
        let key = (
            hostname.to_string(),
            namespace.to_string(),
            name.to_string(),
            version.to_string(),
            format!("{os}_{arch}"),
        );
        match self.archives.get(&key) {
            Some(spec) => Ok(DownloadInfo {
                protocols: vec![],
                os: os.to_string(),
                arch: arch.to_string(),
                filename: spec.filename.clone(),
                download_url: spec.download_url.clone(),
                sha256: spec.sha256.clone(),
                shasums_url: String::new(),
                shasums_signature_url: String::new(),
            }),
            None => Err(Error::NotFound {
                hostname: hostname.to_string(),
                subject: format!("provider {namespace}/{name} version {version} ({os}/{arch})"),
            }),
        }
    }
}

/// Registry wrapper that trips the cancellation token on the first download
/// info request, simulating an interrupt between resolve and write.
pub struct CancelOnDownload<C> {
    pub inner: C,
    pub cancel: CancellationToken,
}

#[async_trait]
impl<C: RegistryClient> RegistryClient for CancelOnDownload<C> {
    async fn get_versions(
        &self,
        cancel: &CancellationToken,
        hostname: &str,
        namespace: &str,
        name: &str,
    ) -> Result<ProviderVersions> {
        self.inner.get_versions(cancel, hostname, namespace, name).await
    }

    async fn get_download_info(
        &self,
        _cancel: &CancellationToken,
        _hostname: &str,
        _namespace: &str,
        _name: &str,
        _version: &str,
        _os: &str,
        _arch: &str,
    ) -> Result<DownloadInfo> {
        self.cancel.cancel();
        Err(Error::Cancelled)
    }
}
