//! Core error types for the store and action cache

use std::path::PathBuf;

/// Result type for store and cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Error type shared by the object store, the action cache, and the
/// on-disk tables backing both.
#[derive(Debug)]
pub enum CacheError {
    /// A key or object id is absent; callers usually treat this as a miss
    NotFound {
        what: &'static str,
        id: String,
        recovery_hint: RecoveryHint,
    },

    /// An action-cache key is already bound to a different value
    Poisoned {
        key: String,
        existing: String,
        new: String,
        recovery_hint: RecoveryHint,
    },

    /// An action-cache value names an object the paired store cannot resolve
    Dangling {
        key: String,
        value: String,
        recovery_hint: RecoveryHint,
    },

    /// I/O error while touching backing storage
    Io {
        path: PathBuf,
        operation: &'static str,
        source: std::io::Error,
        recovery_hint: RecoveryHint,
    },

    /// Structural corruption in a table or object record
    Corruption {
        path: PathBuf,
        reason: String,
        recovery_hint: RecoveryHint,
    },

    /// An on-disk table reached its configured maximum size
    TableFull {
        path: PathBuf,
        capacity: u64,
        recovery_hint: RecoveryHint,
    },

    /// Values from different store instances were mixed
    ConfigMismatch {
        reason: String,
        recovery_hint: RecoveryHint,
    },

    /// A textual id or name failed to parse
    InvalidId {
        text: String,
        reason: String,
        recovery_hint: RecoveryHint,
    },

    /// A remote backend operation was abandoned before completing
    Cancelled {
        operation: &'static str,
        recovery_hint: RecoveryHint,
    },

    /// A remote backend reported a failure
    Remote {
        backend: String,
        message: String,
        recovery_hint: RecoveryHint,
    },
}

/// Recovery hints attached to every error
#[derive(Debug, Clone)]
pub enum RecoveryHint {
    /// Retry the operation
    Retry,

    /// Clear the backing storage and retry
    ClearAndRetry,

    /// Check file permissions
    CheckPermissions { path: PathBuf },

    /// Raise the configured maximum table size
    IncreaseCapacity { suggested_bytes: u64 },

    /// No automated recovery possible
    Manual { instructions: String },

    /// Operation can be safely ignored
    Ignore,

    /// No recovery possible
    NoRecovery,
}

impl CacheError {
    /// Shorthand for an I/O error with a manual-inspection hint.
    pub fn io(path: impl Into<PathBuf>, operation: &'static str, source: std::io::Error) -> Self {
        let path = path.into();
        let recovery_hint = RecoveryHint::CheckPermissions { path: path.clone() };
        CacheError::Io {
            path,
            operation,
            source,
            recovery_hint,
        }
    }

    /// Shorthand for corruption detected in a backing file.
    pub fn corruption(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        CacheError::Corruption {
            path: path.into(),
            reason: reason.into(),
            recovery_hint: RecoveryHint::ClearAndRetry,
        }
    }

    /// True when the error is the recoverable "absent" case.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound { .. })
    }
}
