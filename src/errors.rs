use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("No backup files found in the bucket")]
    NoArtifactsFound,

    #[error("No valid backup files found in the bucket (expected {prefix}*{suffix})")]
    NoEligibleArtifact { prefix: String, suffix: String },

    #[error("Object store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("{program} failed with exit code {}: {stderr}", exit_code.map_or_else(|| "none".to_string(), |c| c.to_string()))]
    Process {
        program: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove temporary file {}: {source}", path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Verification failed: {0}")]
    Verification(String),
}

impl AppError {
    /// Failures worth another attempt. Structural selection errors are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::StoreUnavailable(_)
                | AppError::Transfer(_)
                | AppError::Process { .. }
                | AppError::Timeout { .. }
                | AppError::Spawn { .. }
                | AppError::Io(_)
                | AppError::Database(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
