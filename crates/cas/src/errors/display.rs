//! Display implementations for store and cache errors

use super::types::CacheError;
use std::fmt;

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { what, id, .. } => {
                write!(f, "{what} '{id}' not found")
            }
            Self::Poisoned {
                key, existing, new, ..
            } => write!(
                f,
                "cache poisoned for '{key}' (new='{new}' vs. existing '{existing}')"
            ),
            Self::Dangling { key, value, .. } => write!(
                f,
                "the result object for key '{key}' does not exist in the store: '{value}'"
            ),
            Self::Io {
                path,
                operation,
                source,
                ..
            } => write!(
                f,
                "I/O error during {} on '{}': {}",
                operation,
                path.display(),
                source
            ),
            Self::Corruption { path, reason, .. } => {
                write!(f, "corruption detected in '{}': {reason}", path.display())
            }
            Self::TableFull { path, capacity, .. } => write!(
                f,
                "table '{}' is full (capacity {capacity} bytes)",
                path.display()
            ),
            Self::ConfigMismatch { reason, .. } => {
                write!(f, "mismatched store configuration: {reason}")
            }
            Self::InvalidId { text, reason, .. } => {
                write!(f, "invalid id '{text}': {reason}")
            }
            Self::Cancelled { operation, .. } => {
                write!(f, "operation {operation} was cancelled")
            }
            Self::Remote {
                backend, message, ..
            } => write!(f, "remote cache backend '{backend}' failed: {message}"),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
