use axum::http::StatusCode;
use thiserror::Error;

/// Error kinds surfaced by the storage and query layers.
///
/// Ingest workers recover `Transient` locally (re-enqueue with backoff);
/// `VerificationFailed` aborts the deletion phase of the archive migrator;
/// the HTTP layer maps the rest onto status codes via [`ArchiveError::status`].
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ArchiveError {
    pub fn status(&self) -> StatusCode {
        match self {
            ArchiveError::NotFound => StatusCode::NOT_FOUND,
            ArchiveError::AlreadyExists => StatusCode::CONFLICT,
            ArchiveError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ArchiveError::Transient(_) => StatusCode::BAD_GATEWAY,
            ArchiveError::VerificationFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ArchiveError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ArchiveError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, ArchiveError>;
