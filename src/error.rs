use thiserror::Error;

use crate::container::RuntimeError;

pub type Result<T> = std::result::Result<T, UpdateError>;

/// Errors surfaced by update, rollback and registry operations.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("an update or rollback is already in progress for app {0}")]
    Busy(i64),

    #[error("checksum mismatch: remote={remote} local={local}")]
    Verification { remote: String, local: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("history record {0} has no intact backup to roll back to")]
    RollbackIneligible(i64),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("archive extraction failed: {0}")]
    Archive(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl UpdateError {
    pub fn code(&self) -> &'static str {
        match self {
            UpdateError::Configuration(_) => "config-error",
            UpdateError::Busy(_) => "busy",
            UpdateError::Verification { .. } => "checksum-mismatch",
            UpdateError::NotFound(_) => "not-found",
            UpdateError::RollbackIneligible(_) => "rollback-ineligible",
            UpdateError::InvalidState(_) => "invalid-state",
            UpdateError::Download(_) => "download-failed",
            UpdateError::Archive(_) => "archive-error",
            UpdateError::Io(_) => "io-error",
            UpdateError::Runtime(_) => "runtime-error",
            UpdateError::Database(_) => "db-error",
        }
    }

    pub fn app_not_found(app_id: i64) -> Self {
        UpdateError::NotFound(format!("app {app_id}"))
    }

    pub fn history_not_found(history_id: i64) -> Self {
        UpdateError::NotFound(format!("history record {history_id}"))
    }
}

impl From<zip::result::ZipError> for UpdateError {
    fn from(err: zip::result::ZipError) -> Self {
        UpdateError::Archive(err.to_string())
    }
}
