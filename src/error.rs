//! Error types for the delivery engine
use crate::message::RetryKey;
use crate::store::StoreError;
use std::fmt;

/// Errors surfaced by engine operations.
///
/// Send client failures never appear here: they are absorbed into state
/// transitions (reschedule or dead-letter). Only storage problems propagate,
/// because they risk silently losing track of a failed message.
#[derive(Debug)]
pub enum EngineError {
    /// A retry store or dead letter store operation failed.
    Storage(StoreError),
    /// A dead-letter append failed even after its own retries; the terminal
    /// failure for this message may now be invisible. The loudest failure
    /// the engine has.
    DeadLetterLost { key: RetryKey, source: StoreError },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage failure: {}", e),
            Self::DeadLetterLost { key, source } => {
                write!(f, "dead letter record for {} could not be written: {}", key, source)
            }
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::DeadLetterLost { source, .. } => Some(source),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        Self::Storage(e)
    }
}

impl EngineError {
    /// Check if this error means a dead-letter record was lost.
    pub fn is_dead_letter_lost(&self) -> bool {
        matches!(self, Self::DeadLetterLost { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn storage_display_wraps_source() {
        let err = EngineError::Storage(StoreError::Unavailable("down".into()));
        assert!(err.to_string().contains("storage failure"));
        assert!(err.to_string().contains("down"));
        assert!(err.source().is_some());
        assert!(!err.is_dead_letter_lost());
    }

    #[test]
    fn dead_letter_lost_names_the_key() {
        let err = EngineError::DeadLetterLost {
            key: RetryKey::new("a@b.test", "welcome"),
            source: StoreError::Rejected("full".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("a@b.test/welcome"));
        assert!(msg.contains("could not be written"));
        assert!(err.is_dead_letter_lost());
    }

    #[test]
    fn store_error_converts() {
        let err: EngineError = StoreError::Unavailable("x".into()).into();
        assert!(matches!(err, EngineError::Storage(_)));
    }
}
