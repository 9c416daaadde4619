//! Error types for the scheduler crate.
//!
//! Scheduling-API errors surface synchronously to the caller; handler
//! execution errors never leave the runner (they drive trigger state
//! transitions instead) and have their own type in the handler module.

use copper_metronome_core::TriggerKey;
use copper_metronome_store::StoreError;
use std::fmt;

/// Errors from scheduler operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// A trigger with this key already exists.
    AlreadyScheduled { key: TriggerKey },
    /// No cron expression was supplied and none is configured for the job.
    MissingCronExpression { job: String },
    /// The cron expression could not be parsed.
    InvalidCronExpression { expression: String, reason: String },
    /// The trigger does not exist.
    TriggerNotFound { key: TriggerKey },
    /// An enqueue payload could not be serialized.
    Serialization { reason: String },
    /// The trigger store failed.
    Store(StoreError),
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyScheduled { key } => {
                write!(f, "job is already scheduled: {key}")
            }
            Self::MissingCronExpression { job } => {
                write!(f, "no cron expression supplied or configured for job '{job}'")
            }
            Self::InvalidCronExpression { expression, reason } => {
                write!(f, "invalid cron expression '{expression}': {reason}")
            }
            Self::TriggerNotFound { key } => write!(f, "trigger not found: {key}"),
            Self::Serialization { reason } => {
                write!(f, "command serialization failed: {reason}")
            }
            Self::Store(e) => write!(f, "trigger store error: {e}"),
        }
    }
}

impl std::error::Error for SchedulerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for SchedulerError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_scheduled_display() {
        let err = SchedulerError::AlreadyScheduled {
            key: TriggerKey::new("TestJob"),
        };
        assert!(err.to_string().contains("already scheduled"));
        assert!(err.to_string().contains("DEFAULT.TestJob"));
    }

    #[test]
    fn missing_cron_display() {
        let err = SchedulerError::MissingCronExpression {
            job: "TestJob".to_string(),
        };
        assert!(err.to_string().contains("no cron expression"));
    }

    #[test]
    fn store_error_wraps() {
        let err = SchedulerError::from(StoreError::Backend {
            reason: "connection reset".to_string(),
        });
        assert!(err.to_string().contains("connection reset"));
    }
}
