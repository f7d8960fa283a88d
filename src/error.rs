//! Error kinds for the search core.
//!
//! Remote failures are recoverable and normally only show up as a status flag
//! on a [`crate::offline::SearchSession`]. Store failures are surfaced, since
//! they mean the statistics or library data may be inconsistent.

use thiserror::Error;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    /// Network failure or timeout on the federated search
    #[error("Remote search unavailable: {0}")]
    RemoteUnavailable(String),

    /// The metadata or statistics store failed
    #[error("Local store error: {0}")]
    LocalStore(String),

    /// A single payload is larger than the whole cache budget
    #[error("Cache entry `{key}` ({size} bytes) exceeds the cache budget of {budget} bytes")]
    CacheCapacityExceeded { key: String, size: usize, budget: usize },

    /// Both the local and the remote branch failed and nothing was cached
    #[error("Search unavailable (local: {local}; remote: {remote})")]
    SearchUnavailable { local: String, remote: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::LocalStore(err.to_string())
    }
}

impl From<tokio::task::JoinError> for CoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::LocalStore(format!("store task failed: {err}"))
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::RemoteUnavailable(format!("request timed out: {err}"))
        } else {
            Self::RemoteUnavailable(err.to_string())
        }
    }
}

impl CoreError {
    /// True for failures the coordinator recovers from by falling back
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RemoteUnavailable(_) | Self::CacheCapacityExceeded { .. }
        )
    }
}
