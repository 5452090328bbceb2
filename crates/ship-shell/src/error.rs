use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("Command blocked: {reason}")]
    CommandBlocked { reason: String },

    #[error("Too many active shell sessions (max {max})")]
    CapacityExceeded { max: usize },

    #[error("Unknown shell session: {id}")]
    UnknownSession { id: u64 },

    #[error("Stdin closed for shell session {id}")]
    StdinClosed { id: u64 },

    #[error("Spawn failed: {0}")]
    Spawn(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShellError {
    /// Stable snake_case error code for tool results and logs.
    pub fn code(&self) -> &'static str {
        match self {
            ShellError::CommandBlocked { .. } => "command_blocked",
            ShellError::CapacityExceeded { .. } => "too_many_sessions",
            ShellError::UnknownSession { .. } => "shell_unknown_session",
            ShellError::StdinClosed { .. } => "shell_stdin_closed",
            ShellError::Spawn(_) => "spawn_failed",
            ShellError::Io(_) => "io_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, ShellError>;
