//! Error taxonomy shared by every TaskLane crate.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, TaskLaneError>;

#[derive(Debug, Error)]
pub enum TaskLaneError {
    /// Malformed submit/filter/patch input. Raised before any record is touched.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    NotFound(String),

    /// Illegal transition request (cancel-after-terminal, retry-on-non-failed, ...).
    #[error("State conflict: {0}")]
    StateConflict(String),

    /// The store rejected a write because the record changed since it was read.
    #[error("Stale write rejected for task {0}")]
    StaleWrite(String),

    /// No resolvable processor, or the lane broker refused the token.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// A handler raised or reported failure.
    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Config error: {0}")]
    Config(String),

    /// A notify sink could not deliver an event. Never affects task state.
    #[error("Notify error: {0}")]
    Notify(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TaskLaneError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::StateConflict(msg.into())
    }

    pub fn dispatch(msg: impl Into<String>) -> Self {
        Self::Dispatch(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Whether the caller may re-read the record and try the write again.
    pub fn is_stale_write(&self) -> bool {
        matches!(self, Self::StaleWrite(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let e = TaskLaneError::validation("description is empty");
        assert_eq!(e.to_string(), "Validation error: description is empty");

        let e = TaskLaneError::NotFound("t-1".into());
        assert_eq!(e.to_string(), "Task not found: t-1");
    }

    #[test]
    fn test_stale_write_flag() {
        assert!(TaskLaneError::StaleWrite("t-1".into()).is_stale_write());
        assert!(!TaskLaneError::conflict("nope").is_stale_write());
    }
}
