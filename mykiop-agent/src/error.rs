//! Error types for the MykiOp agent
//!
//! Remote failures carry the distinction the reconciliation engine needs:
//! only `Unreachable` means the network itself is gone.

use std::path::PathBuf;
use thiserror::Error;

/// Failures talking to the remote aggregate or object store
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote unreachable: {0}")]
    Unreachable(String),
    #[error("remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("malformed remote payload: {0}")]
    Malformed(String),
    #[error("local file {path}: {source}")]
    LocalFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RemoteError {
    /// True when the failure says nothing about the request and everything
    /// about connectivity.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, RemoteError::Unreachable(_))
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            RemoteError::Unreachable(err.to_string())
        } else if err.is_decode() {
            RemoteError::Malformed(err.to_string())
        } else if let Some(status) = err.status() {
            RemoteError::Rejected {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            RemoteError::Unreachable(err.to_string())
        }
    }
}

/// Durable cache I/O failures
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Sensor notification that does not match the notification grammar
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SensorError {
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    #[error("unexpected notification format: {0:?}")]
    UnknownFormat(String),
    #[error("invalid counter {field} in {raw:?}")]
    InvalidCounter { field: &'static str, raw: String },
}

/// Configuration that cannot drive the agent
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),
    #[error("vehicle.device_id must not be empty")]
    EmptyDeviceId,
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("could not find config directory")]
    NoConfigDir,
    #[error("config I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialization: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Outcome of applying one pending operation that did not commit
#[derive(Debug, Error)]
pub enum ApplyError {
    /// Worth retrying on a later drain sweep
    #[error("retryable: {0}")]
    Retryable(#[source] RemoteError),
    /// Can never succeed; the entry is dropped
    #[error("permanent: {0}")]
    Permanent(String),
}

impl From<RemoteError> for ApplyError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::LocalFile { path, source }
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                ApplyError::Permanent(format!("{} no longer exists", path.display()))
            }
            other => ApplyError::Retryable(other),
        }
    }
}

impl ApplyError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, ApplyError::Retryable(e) if e.is_unreachable())
    }
}
