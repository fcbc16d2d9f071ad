use crate::domain::models::TaskId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    #[error("timer already running for task {running}; stop it first")]
    AlreadyRunning { running: TaskId },
    #[error("a drained batch is still outstanding")]
    DrainInProgress,
    #[error("failed to persist task {task_id}: {reason}")]
    PersistenceFailure { task_id: TaskId, reason: String },
    #[error("background timer unavailable: {0}")]
    BackgroundTimerUnavailable(String),
    #[error("storage worker failed: {0}")]
    StorageWorker(#[from] tokio::task::JoinError),
}

impl InfraError {
    pub(crate) fn poisoned(what: &str, error: impl std::fmt::Display) -> Self {
        InfraError::InvalidConfig(format!("{what} lock poisoned: {error}"))
    }
}
