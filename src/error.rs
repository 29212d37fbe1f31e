//! Error types shared by every module of the crate.

use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

/// All failures surfaced by the conversion, persistence and CLI layers
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed tabular input or document shape
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Filesystem write failure
    #[error("failed to write {}: {source}", path.display())]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Filesystem read failure
    #[error("failed to read {}: {source}", path.display())]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A value with no JSON representation (e.g. infinity)
    #[error("cannot serialize value at {path}: {reason}")]
    Serialization { path: String, reason: String },

    /// Malformed JSON text
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid environment, settings or credentials
    #[error("configuration error: {0}")]
    Config(String),

    /// Vendor response could not be interpreted
    #[error("datafeed error: {0}")]
    Datafeed(String),

    /// Dataframe construction or access failure
    #[error("dataframe error: {0}")]
    Polars(#[from] polars::prelude::PolarsError),

    /// PDF rendering failure
    #[error("report rendering failed: {0}")]
    Report(String),

    /// HTTP transport failure
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid strategy parameters
    #[error("strategy error: {0}")]
    Strategy(String),
}

impl Error {
    pub(crate) fn io_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::IoWrite {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn io_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::IoRead {
            path: path.into(),
            source,
        }
    }
}
