use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid context id: {0}")]
    InvalidContextId(String),

    #[error("Store error: {0}")]
    Store(#[from] ship_store::StoreError),
}

impl SchedulerError {
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::InvalidContextId(_) => "invalid_context_id",
            SchedulerError::Store(e) => e.code(),
        }
    }
}

impl From<ship_core::CoreError> for SchedulerError {
    fn from(e: ship_core::CoreError) -> Self {
        match e {
            ship_core::CoreError::InvalidContextId(msg) => SchedulerError::InvalidContextId(msg),
            other => SchedulerError::Store(ship_store::StoreError::Io(std::io::Error::other(
                other.to_string(),
            ))),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
