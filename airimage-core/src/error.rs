use std::path::PathBuf;

use thiserror::Error;

/// Failures that prevent an [`ImageCache`](crate::ImageCache) from being built.
///
/// Lookups and saves never surface errors; see [`WriteError`] and
/// [`FetchError`] for the failures they log and fold into a miss.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// A best-effort disk write that did not land.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("cache root is unavailable")]
    RootUnavailable,

    #[error("failed to encode image: {0}")]
    Encode(#[from] CodecError),

    #[error("failed to write cache file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Why a network fetch produced no image.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timeout error")]
    Timeout,

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

impl FetchError {
    /// Cancellation is the expected outcome of an explicit cancel and is not
    /// worth a warning.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Failed to encode image: {0}")]
    Encode(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;
