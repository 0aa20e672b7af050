//! Error types for the harvest and check pipelines

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid sources file: {0}")]
    Toml(#[from] toml::de::Error),

    /// Target answered, but not with HTTP 200.
    #[error("Unexpected response status {0}")]
    Status(u16),

    #[error("Unparseable response: {0}")]
    Parse(String),

    #[error("Source {id} failed: {reason}")]
    Source { id: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Operator interrupt. Raised after every started worker has settled.
    #[error("Run cancelled after {finished} of {total} work items")]
    Cancelled { finished: usize, total: usize },
}

impl Error {
    pub fn source_failure(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Source {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    /// Status code carried by a failed classification attempt, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Status(code) => Some(*code),
            Error::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
