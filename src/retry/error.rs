use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("Maximum attempts ({0}) exhausted: {1}")]
    MaxRetriesExceeded(u32, String),

    #[error("Permanent failure after {0} attempt(s): {1}")]
    Permanent(u32, String),

    #[error("Retry budget of {0:?} exhausted: {1}")]
    ElapsedTimeExceeded(Duration, String),

    #[error("Retry interrupted by shutdown signal")]
    Interrupted,
}

impl RetryError {
    /// Text of the last operation failure, if any attempt ran
    pub fn last_error(&self) -> Option<&str> {
        match self {
            RetryError::MaxRetriesExceeded(_, e)
            | RetryError::Permanent(_, e)
            | RetryError::ElapsedTimeExceeded(_, e) => Some(e),
            RetryError::Interrupted => None,
        }
    }
}
