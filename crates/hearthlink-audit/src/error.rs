//! Audit log error types

use thiserror::Error;

/// Errors that can occur while writing the audit log
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timestamp out of range: {0}")]
    InvalidTimestamp(i64),
}

pub type AuditResult<T> = Result<T, AuditError>;
