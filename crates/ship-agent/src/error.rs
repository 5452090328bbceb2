use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid context id: {0}")]
    InvalidContextId(String),

    #[error("Runner is bound to context {bound}, got {got}")]
    ContextMismatch { bound: String, got: String },

    #[error("Store error: {0}")]
    Store(#[from] ship_store::StoreError),
}

impl AgentError {
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::InvalidContextId(_) => "invalid_context_id",
            AgentError::ContextMismatch { .. } => "context_mismatch",
            AgentError::Store(e) => e.code(),
        }
    }
}

impl From<ship_core::CoreError> for AgentError {
    fn from(e: ship_core::CoreError) -> Self {
        match e {
            ship_core::CoreError::InvalidContextId(msg) => AgentError::InvalidContextId(msg),
            other => AgentError::Store(ship_store::StoreError::Io(std::io::Error::other(
                other.to_string(),
            ))),
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
