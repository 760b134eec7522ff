//! Error types for sync operations.

use std::path::PathBuf;
use thiserror::Error;

/// Error type covering every failure the sync engine can encounter.
///
/// Reconciliation is per-key best-effort: most of these are logged at the
/// call site and the offending key is skipped. Only `Config` errors abort
/// process startup.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("origin request failed after retries: {0}")]
    RetriesExhausted(String),

    #[error("origin response missing field: {0}")]
    MissingField(&'static str),

    #[error("object store tool exited with {code}: {stderr}")]
    Tool { code: i32, stderr: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Wrap an io::Error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
