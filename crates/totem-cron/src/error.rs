//! Scheduler error types.

use thiserror::Error;

use totem_storage::StorageError;

/// Rejected task input. Raised at create/update time, before anything is
/// persisted; the scheduler never sees an invalid task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid frequency '{input}': {reason}")]
    Frequency { input: String, reason: String },

    #[error("unknown timezone '{0}'")]
    Timezone(String),

    #[error("invalid command: {0}")]
    Command(String),

    #[error("description must not be empty")]
    Description,

    #[error("timeout must be at least one second")]
    Timeout,

    #[error("invalid retention '{0}': expected runs:N or days:N")]
    Retention(String),
}

impl ValidationError {
    pub(crate) fn frequency(input: &str, reason: impl Into<String>) -> Self {
        ValidationError::Frequency {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("store unavailable: {0}")]
    StoreUnavailable(StorageError),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task {0} is already running")]
    AlreadyRunning(String),
}

impl From<StorageError> for SchedulerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::AlreadyRunning { task_id } => SchedulerError::AlreadyRunning(task_id),
            other => SchedulerError::StoreUnavailable(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
