use thiserror::Error;
use uuid::Uuid;

use crate::alarm::AlarmStatus;

/// Main error type for relgraph
#[derive(Error, Debug)]
pub enum RelgraphError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization of stored documents
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input rejected before any write
    #[error("Validation error: {0}")]
    Validation(String),

    /// Alarm not found for the given tenant
    #[error("Alarm not found: {0}")]
    AlarmNotFound(Uuid),

    /// Alarm is not in a valid source state for the requested transition
    #[error("Invalid alarm state: cannot {action} alarm {alarm_id} in status {status}")]
    InvalidAlarmState {
        alarm_id: Uuid,
        status: AlarmStatus,
        action: &'static str,
    },

    /// Blocking database task was cancelled or panicked
    #[error("Background task failed: {0}")]
    Task(String),
}

impl RelgraphError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

/// Convenient Result type using RelgraphError
pub type Result<T> = std::result::Result<T, RelgraphError>;
