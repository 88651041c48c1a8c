//! Error types shared across the mirror build pipeline.
//!
//! Retry decisions hinge on the error kind, not on string matching: transient
//! failures (network I/O, HTTP 429/5xx) carry an optional `Retry-After` hint
//! and are the only variants the HTTP layer and downloader will retry.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type for mirror operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building, planning, or verifying a mirror.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed manifest or invalid option.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Provider or version absent from the registry.
    #[error("{subject} not found on {hostname}")]
    NotFound { hostname: String, subject: String },

    /// The selected version does not publish a requested platform.
    #[error("provider {provider} version {version} does not have platform {platform}")]
    PlatformUnavailable {
        provider: String,
        version: String,
        platform: String,
    },

    /// Retryable failure: network I/O, HTTP 429, or HTTP 5xx.
    #[error("{message}")]
    Transient {
        message: String,
        status: Option<u16>,
        retry_after: Option<Duration>,
    },

    /// A transient failure that survived the whole retry budget.
    #[error("max retries exceeded after {attempts} attempt(s): {source}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// Checksum mismatch. Never retried.
    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    Integrity {
        file: String,
        expected: String,
        actual: String,
    },

    /// Archive that cannot be read as a ZIP. Never retried.
    #[error("malformed archive {file}: {reason}")]
    Archive { file: String, reason: String },

    /// Unexpected response shape from a registry.
    #[error("{0}")]
    Protocol(String),

    /// Caller cancellation (SIGINT/SIGTERM at the CLI boundary).
    #[error("operation cancelled")]
    Cancelled,

    /// Aggregate failure reported by the orchestrator.
    #[error("{failures} download(s) failed")]
    Download { failures: usize },

    /// Filesystem failure, with the offending path.
    #[error("failed to {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Wraps a filesystem error with the operation and path for context.
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// True if the retry loop may attempt this operation again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }

    /// Server-provided backoff hint, if the last response carried one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// True if this error (or its retry-exhausted cause) is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::ExhaustedRetries { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}
