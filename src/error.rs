//! Error kinds for the ingestion and retrieval core.
//!
//! Library components return [`Result<T>`] with one of these variants so
//! callers can react to the kind of failure: a [`Error::Parse`] isolates one
//! platform, a [`Error::ProviderUnavailable`] is retryable (or degrades a
//! query), and an [`Error::Index`] is fatal for the current operation.
//!
//! An empty index is deliberately absent here: it yields an empty result
//! list, never an error.

use thiserror::Error;

use crate::models::Platform;

#[derive(Error, Debug)]
pub enum Error {
    /// A platform export could not be read or decoded.
    #[error("failed to parse {platform} export: {message}")]
    Parse { platform: Platform, message: String },

    /// The embedding backend is unreachable, rate-limited, or misconfigured.
    #[error("embedding provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Storage-layer failure (index or embedding cache).
    #[error("index error: {0}")]
    Index(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn parse(platform: Platform, message: impl Into<String>) -> Self {
        Error::Parse {
            platform,
            message: message.into(),
        }
    }

    /// True for failures worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ProviderUnavailable(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Index(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    /// The request URL is dropped; it can carry credentials.
    fn from(err: reqwest::Error) -> Self {
        Error::ProviderUnavailable(err.without_url().to_string())
    }
}
