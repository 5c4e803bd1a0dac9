//! Transport error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("call deadline exceeded")]
    DeadlineExceeded,
}

impl TransportError {
    /// Connect and read timeouts are retried with backoff; nothing else is.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(Box::new(err))
        } else {
            Self::Network(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
