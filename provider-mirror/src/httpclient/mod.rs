//! Shared HTTP transport with retry, backoff, and hostname-scoped auth.
//!
//! Both the registry client and the downloader go through this layer. Retry
//! covers network failures and HTTP 429/5xx only; everything else is returned
//! to the caller untouched. `Retry-After` hints are honored when given as
//! integer seconds (HTTP-date values are ignored).

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Project URL advertised in the User-Agent header.
const PROJECT_URL: &str = "https://github.com/provider-mirror/provider-mirror";

/// Configures the HTTP client behavior.
#[derive(Debug, Clone)]
pub struct Config {
    pub timeout: Duration,
    pub retries: u32,
    pub max_backoff: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retries: 3,
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Returns the User-Agent string for all outgoing requests.
pub fn user_agent() -> String {
    format!(
        "provider-mirror/{} ({}/{}; +{})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH,
        PROJECT_URL,
    )
}

/// Per-request options. `with_retry` opts into the transient-failure retry
/// loop; `with_auth` attaches a bearer token when credentials are known for
/// the hostname.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    retry: bool,
    auth_hostname: Option<String>,
    timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self) -> Self {
        self.retry = true;
        self
    }

    pub fn with_auth(mut self, hostname: &str) -> Self {
        self.auth_hostname = Some(hostname.to_string());
        self
    }

    /// Overrides the client-level timeout for this request (archive
    /// downloads use a longer budget than metadata calls).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Shared HTTP client with retry and auth support.
#[derive(Debug)]
pub struct HttpClient {
    inner: reqwest::Client,
    credentials: HashMap<String, String>,
    retries: u32,
    max_backoff: Duration,
    user_agent: String,
}

impl HttpClient {
    /// Creates a client, scanning the process environment for registry
    /// credentials.
    pub fn new(cfg: Config) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            inner,
            credentials: load_credentials(std::env::vars()),
            retries: cfg.retries,
            max_backoff: cfg.max_backoff,
            user_agent: user_agent(),
        })
    }

    /// Builds a GET request for `url`.
    pub fn get(&self, url: &str) -> Result<reqwest::Request> {
        self.inner
            .get(url)
            .build()
            .map_err(|e| Error::Protocol(format!("building request for {url}: {e}")))
    }

    /// Executes a request with the given options.
    ///
    /// The original request is never mutated: each attempt works on a clone,
    /// so callers holding the request and the retry loop itself stay safe.
    pub async fn execute(
        &self,
        req: reqwest::Request,
        opts: RequestOptions,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        if !opts.retry {
            let prepared = self.prepare(&req, &opts)?;
            return self.send(prepared, cancel).await;
        }

        let mut last_err: Option<Error> = None;

        for attempt in 0..=self.retries {
            if attempt > 0 {
                let wait = backoff(
                    attempt,
                    self.max_backoff,
                    last_err.as_ref().and_then(Error::retry_after),
                );
                debug!(
                    attempt = attempt + 1,
                    max_attempts = self.retries + 1,
                    backoff_ms = wait.as_millis() as u64,
                    url = %req.url(),
                    "retrying request"
                );
                sleep_cancellable(wait, cancel).await?;
            }

            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let prepared = self.prepare(&req, &opts)?;
            match self.send(prepared, cancel).await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if is_retryable_status(status) {
                        let retry_after = parse_retry_after(
                            resp.headers()
                                .get(reqwest::header::RETRY_AFTER)
                                .and_then(|v| v.to_str().ok()),
                        );
                        last_err = Some(Error::Transient {
                            message: format!("HTTP {status}"),
                            status: Some(status),
                            retry_after,
                        });
                        continue;
                    }
                    return Ok(resp);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) if e.is_transient() => {
                    last_err = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::ExhaustedRetries {
            attempts: self.retries + 1,
            source: Box::new(last_err.unwrap_or_else(|| Error::Transient {
                message: "request failed".to_string(),
                status: None,
                retry_after: None,
            })),
        })
    }

    /// Clones the request and applies User-Agent, auth, and timeout.
    fn prepare(&self, req: &reqwest::Request, opts: &RequestOptions) -> Result<reqwest::Request> {
        let mut cloned = req
            .try_clone()
            .ok_or_else(|| Error::Protocol("request body cannot be cloned for retry".to_string()))?;

        if !cloned.headers().contains_key(reqwest::header::USER_AGENT) {
            if let Ok(value) = reqwest::header::HeaderValue::from_str(&self.user_agent) {
                cloned.headers_mut().insert(reqwest::header::USER_AGENT, value);
            }
        }

        if let Some(hostname) = &opts.auth_hostname {
            if let Some(token) = self.credentials.get(hostname) {
                if let Ok(value) =
                    reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
                {
                    cloned
                        .headers_mut()
                        .insert(reqwest::header::AUTHORIZATION, value);
                }
            }
        }

        if let Some(timeout) = opts.timeout {
            *cloned.timeout_mut() = Some(timeout);
        }

        Ok(cloned)
    }

    async fn send(
        &self,
        req: reqwest::Request,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let url = req.url().to_string();
        tokio::select! {
            result = self.inner.execute(req) => {
                result.map_err(|e| Error::Transient {
                    message: format!("request to {url} failed: {e}"),
                    status: None,
                    retry_after: None,
                })
            }
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }
}

/// Sleeps for `duration`, returning `Cancelled` if the token trips first.
pub async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}

/// True for HTTP status codes the retry loop covers.
pub fn is_retryable_status(code: u16) -> bool {
    matches!(code, 429 | 500 | 502 | 503 | 504)
}

/// Maps a non-OK HTTP status to an error: transient for 429/5xx, protocol
/// otherwise.
pub fn status_error(status: u16, retry_after: Option<Duration>) -> Error {
    if is_retryable_status(status) {
        Error::Transient {
            message: format!("HTTP {status}"),
            status: Some(status),
            retry_after,
        }
    } else {
        Error::Protocol(format!("HTTP {status}"))
    }
}

/// Parses a `Retry-After` header value. Integer seconds only; anything else
/// (including HTTP-date form) is treated as absent.
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Backoff for a retry attempt (1-based). Uses the server hint when present
/// (capped to `max_backoff`); otherwise `2^attempt` seconds clamped to
/// `max_backoff`, with ±12.5% jitter.
pub fn backoff(attempt: u32, max_backoff: Duration, retry_after: Option<Duration>) -> Duration {
    if let Some(hint) = retry_after {
        return hint.min(max_backoff);
    }

    let base = Duration::from_secs(1u64 << attempt.min(30)).min(max_backoff);
    let jitter = base.as_secs_f64() * rand::thread_rng().gen_range(-0.125..0.125);
    let total = base.as_secs_f64() + jitter;

    Duration::from_secs_f64(total.max(0.0))
}

/// Loads registry credentials from `PM_TOKEN_<host>` and `TF_TOKEN_<host>`
/// variables. Hostname encoding: `.` becomes `_`, a literal `_` becomes
/// `__`. `PM_TOKEN_*` wins on conflict.
fn load_credentials<I>(vars: I) -> HashMap<String, String>
where
    I: Iterator<Item = (String, String)>,
{
    let mut pm = HashMap::new();
    let mut tf = HashMap::new();

    for (key, value) in vars {
        if let Some(encoded) = key.strip_prefix("PM_TOKEN_") {
            pm.insert(decode_hostname(encoded), value);
        } else if let Some(encoded) = key.strip_prefix("TF_TOKEN_") {
            tf.insert(decode_hostname(encoded), value);
        }
    }

    let mut creds = tf;
    creds.extend(pm);
    creds
}

/// Decodes `registry_terraform_io` -> `registry.terraform.io`, preserving
/// double underscores as literal underscores.
fn decode_hostname(encoded: &str) -> String {
    encoded
        .replace("__", "\u{0}")
        .replace('_', ".")
        .replace('\u{0}', "_")
}
