//! Error types for kyronorm.
//!
//! All errors are strongly typed using thiserror. The taxonomy mirrors the
//! degrade paths of the engine: oracle errors are recoverable by falling back
//! to a safe create, storage conflicts are resolved by upsert, and cluster
//! failures stay isolated to the cluster that produced them.

use thiserror::Error;

use crate::record::{NormalizedId, NormalizedKind};
use crate::storage::StorageError;

/// Validation errors that occur during input validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Confidence value {value} is out of range [0.0, 1.0]")]
    ConfidenceOutOfRange {
        value: f32,
    },

    #[error("Fragment text is empty after canonicalization")]
    EmptyFragment,

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidField {
        field: String,
        reason: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Errors raised by the semantic equivalence oracle or while validating its output.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("Oracle transport failed: {message}")]
    Transport {
        message: String,
    },

    #[error("Oracle call timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Oracle returned a malformed response: {reason}")]
    Malformed {
        reason: String,
    },

    #[error("Oracle matched unknown candidate '{claimed}'")]
    UnverifiableMatch {
        claimed: String,
    },
}

impl OracleError {
    /// Creates a malformed-response error.
    #[must_use]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }

    /// Creates a transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }
}

/// Execution errors that occur while running a resolution or merge.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Normalized {kind} record not found: {id}")]
    RecordNotFound {
        kind: NormalizedKind,
        id: NormalizedId,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Worker queue is full (capacity {capacity})")]
    QueueFull {
        capacity: usize,
    },

    #[error("Worker pool disconnected")]
    Disconnected,

    #[error("Stale merge cluster: {reason}")]
    StaleCluster {
        reason: String,
    },
}

/// Top-level error type for kyronorm.
#[derive(Debug, Error)]
pub enum NormError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl NormError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an oracle error.
    #[must_use]
    pub const fn is_oracle(&self) -> bool {
        matches!(self, Self::Oracle(_))
    }

    /// Returns true if this is a storage error.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Internal { .. } => false,
            Self::Execution(e) => matches!(
                e,
                ExecutionError::Timeout { .. }
                    | ExecutionError::QueueFull { .. }
                    | ExecutionError::StaleCluster { .. }
            ),
            Self::Oracle(e) => matches!(
                e,
                OracleError::Transport { .. } | OracleError::Timeout { .. }
            ),
            Self::Storage(e) => matches!(
                e,
                StorageError::ConstraintConflict(_) | StorageError::Backend(_)
            ),
        }
    }
}

/// Result type alias for kyronorm operations.
pub type NormResult<T> = Result<T, NormError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_confidence() {
        let err = ValidationError::ConfidenceOutOfRange { value: 1.5 };
        let msg = format!("{err}");
        assert!(msg.contains("1.5"));
        assert!(msg.contains("out of range"));
    }

    #[test]
    fn test_oracle_error_display() {
        let err = OracleError::UnverifiableMatch {
            claimed: "abc".to_string(),
        };
        assert!(err.to_string().contains("abc"));

        let err = OracleError::malformed("missing action");
        assert!(err.to_string().contains("missing action"));
    }

    #[test]
    fn test_execution_error_record_not_found() {
        let err = ExecutionError::RecordNotFound {
            kind: NormalizedKind::Aspect,
            id: NormalizedId::nil(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("aspect"));
        assert!(msg.contains("not found"));
    }

    #[test]
    fn test_norm_error_from_oracle() {
        let err: NormError = OracleError::Timeout { duration_ms: 10 }.into();
        assert!(err.is_oracle());
        assert!(err.is_retryable());

        let err: NormError = OracleError::malformed("bad json").into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_norm_error_retryable() {
        let err: NormError = ValidationError::EmptyFragment.into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());

        let err: NormError = StorageError::ConstraintConflict("helado".to_string()).into();
        assert!(err.is_storage());
        assert!(err.is_retryable());

        let err: NormError = ExecutionError::Disconnected.into();
        assert!(!err.is_retryable());

        let err = NormError::internal("unexpected state");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("unexpected state"));
    }
}
