use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("OAuth refresh failed: {0}")]
    RefreshFailed(String),

    #[error("No refresh token stored")]
    MissingRefreshToken,

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AuthError>;
