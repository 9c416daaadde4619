//! Error types for trigger store operations.

use copper_metronome_core::TriggerKey;
use std::fmt;

/// Errors from trigger store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Trigger not found.
    NotFound { key: TriggerKey },
    /// Trigger already exists.
    AlreadyExists { key: TriggerKey },
    /// The backing storage failed.
    Backend { reason: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { key } => write!(f, "trigger not found: {key}"),
            Self::AlreadyExists { key } => write!(f, "trigger already exists: {key}"),
            Self::Backend { reason } => write!(f, "trigger store backend failed: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display() {
        let err = StoreError::AlreadyExists {
            key: TriggerKey::new("TestJob"),
        };
        assert!(err.to_string().contains("already exists"));
        assert!(err.to_string().contains("DEFAULT.TestJob"));
    }
}
