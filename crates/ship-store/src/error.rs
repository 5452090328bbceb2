use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid context id: {0}")]
    InvalidContextId(String),

    #[error("Context lock not acquired within {waited_ms}ms: {path}")]
    LockTimeout { path: String, waited_ms: u64 },

    #[error("Compaction summary failed: {0}")]
    CompactionSummaryFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Stable snake_case error code for logs and callers.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::InvalidContextId(_) => "invalid_context_id",
            StoreError::LockTimeout { .. } => "lock_timeout",
            StoreError::CompactionSummaryFailed(_) => "compaction_summary_failed",
            StoreError::Serialization(_) => "serialization_error",
            StoreError::Io(_) => "io_error",
        }
    }
}

impl From<ship_core::CoreError> for StoreError {
    fn from(e: ship_core::CoreError) -> Self {
        match e {
            ship_core::CoreError::InvalidContextId(msg) => StoreError::InvalidContextId(msg),
            ship_core::CoreError::Serialization(e) => StoreError::Serialization(e),
            ship_core::CoreError::Io(e) => StoreError::Io(e),
            other => StoreError::InvalidContextId(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
