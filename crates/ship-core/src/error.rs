use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid context id: {0}")]
    InvalidContextId(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Stable snake_case error code surfaced to callers and logs.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidContextId(_) => "invalid_context_id",
            CoreError::Config(_) => "config_error",
            CoreError::Serialization(_) => "serialization_error",
            CoreError::Io(_) => "io_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
