//! Error types for cache, lookup and pipeline operations.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the persistent memo cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to read cache file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("failed to persist cache file {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode cache entries: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors raised by a lookup capability (whois client, geo database).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("invalid IP address '{0}'")]
    InvalidAddress(String),

    #[error("geo database error: {0}")]
    Database(String),
}

/// Errors that stop the annotation pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("lookup '{lookup}' failed for {ip} on line {line}: {source}")]
    Lookup {
        lookup: String,
        ip: String,
        line: u64,
        #[source]
        source: LookupError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Cache(#[from] CacheError),
}
