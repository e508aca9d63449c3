use thiserror::Error;

/// Convenience type alias for Results with NocturnalError
pub type Result<T> = std::result::Result<T, NocturnalError>;

/// Main error type for the nocturnal orchestration core
///
/// Validation errors surface to the caller and are never retried; git and
/// filesystem failures carry the subprocess stderr or io cause; executor
/// failures are handled by the queue's retry policy.
#[derive(Error, Debug)]
pub enum NocturnalError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task execution error: {task_id} - {message}")]
    TaskExecution { task_id: String, message: String },

    #[error("Timeout error: {message}")]
    Timeout { message: String },

    #[error("Git error: {message}")]
    Git { message: String },

    #[error("Merge error: {message}")]
    Merge { message: String },

    #[error("Backup error: {message}")]
    Backup { message: String },

    #[error("Rollback error: {message}")]
    Rollback { message: String },

    #[error("Safety violation: {0}")]
    Safety(String),

    #[error("System resource error: {message}")]
    SystemResource { message: String },

    #[error("Queue is full")]
    QueueFull,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Session state error: {message}")]
    SessionState { message: String },

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl NocturnalError {
    /// Exit code for the CLI boundary: validation errors map to 1,
    /// everything else to 2.
    pub fn exit_code(&self) -> i32 {
        match self {
            NocturnalError::Validation(_) | NocturnalError::Config(_) => 1,
            _ => 2,
        }
    }
}
