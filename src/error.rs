//! Error types for the record store.

use thiserror::Error;

/// Main error type for queue, store and broadcast operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Repository error: {0}")]
    Repository(String),

    /// A latest-wins ticket was preempted by a newer submission before it ran.
    #[error("Superseded by a newer submission")]
    Superseded,

    #[error("Work unit panicked: {0}")]
    Panicked(String),

    /// A deferred ticket's completer was dropped without completing.
    #[error("Deferred work was abandoned before completion")]
    Abandoned,

    #[error("Queue is closed")]
    Closed,

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StoreError {
    /// Wrap any backing-store failure.
    pub fn repository(err: impl std::fmt::Display) -> Self {
        StoreError::Repository(err.to_string())
    }

    /// True for the routine cancellation outcome of `run_latest`.
    pub fn is_superseded(&self) -> bool {
        matches!(self, StoreError::Superseded)
    }

    /// Build a `Panicked` error from a caught panic payload.
    pub(crate) fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        StoreError::Panicked(msg)
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_payload_messages() {
        let err = StoreError::from_panic(&"boom");
        assert_eq!(err, StoreError::Panicked("boom".into()));

        let err = StoreError::from_panic(&String::from("owned"));
        assert_eq!(err, StoreError::Panicked("owned".into()));

        let err = StoreError::from_panic(&42u32);
        assert!(matches!(err, StoreError::Panicked(_)));
    }

    #[test]
    fn test_superseded_is_distinguishable() {
        assert!(StoreError::Superseded.is_superseded());
        assert!(!StoreError::Panicked("x".into()).is_superseded());
        assert!(!StoreError::repository("disk full").is_superseded());
    }
}
