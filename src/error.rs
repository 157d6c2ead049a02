//! Crate-level error type.

use thiserror::Error;

/// Every fallible operation in the crate returns this error.
#[derive(Debug, Error)]
pub enum HeatmapError {
    /// The observation store could not be read or written.
    #[error("observation store error: {0}")]
    Store(#[source] rusqlite::Error),

    /// The alert ledger could not be read or written.
    #[error("alert ledger error: {0}")]
    Ledger(#[source] rusqlite::Error),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("could not parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An HTTP request could not be parsed.
    #[error("bad request: {0}")]
    Http(String),

    /// A blocking store task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl HeatmapError {
    pub(crate) fn store(e: rusqlite::Error) -> Self {
        HeatmapError::Store(e)
    }

    pub(crate) fn ledger(e: rusqlite::Error) -> Self {
        HeatmapError::Ledger(e)
    }
}

pub type Result<T> = std::result::Result<T, HeatmapError>;
