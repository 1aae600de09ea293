//! # Error Handling
//!
//! Structured error taxonomy for the storage engine. Each variant carries
//! the context needed to explain a failure to a caller without re-deriving
//! it from a bare string: construct the precise variant at the point of
//! failure and propagate with `?`.
//!
//! ## Error Categories
//!
//! - **Client errors**: precondition failures, missing/invalid input, quota
//! - **Concurrency errors**: lock contention, checksum mismatches, races
//! - **Storage errors**: I/O, serialization, invariant violations

use std::path::PathBuf;
use thiserror::Error;

/// Application error enumeration covering every failure mode described in
/// the error handling design: each kind is either surfaced verbatim to the
/// caller, or logged and converted (`NoAttribute` -> `NotFound` at backend
/// boundaries).
#[derive(Error, Debug)]
pub enum AppError {
    /// No node, attribute, space, or upload exists at the given location.
    #[error("not found: {message}")]
    NotFound { message: String },

    /// A race creating a child-name symlink (or upload) was lost.
    #[error("already exists: {path}")]
    AlreadyExists { path: PathBuf },

    /// The executant lacks the permission required for this operation.
    #[error("permission denied: {message}")]
    PermissionDenied { message: String },

    /// The request cannot be satisfied given current node state (e.g.
    /// overwriting a directory with a file, or a missing parent).
    #[error("precondition failed: {message}")]
    PreconditionFailed { message: String },

    /// `if-match` / `if-none-match` / `if-unmodified-since` mismatched the
    /// node's current etag or mtime.
    #[error("aborted: {message}")]
    Aborted { message: String },

    /// The client-declared checksum did not match the bytes received.
    #[error("checksum mismatch: declared {declared} computed {computed}")]
    ChecksumMismatch { declared: String, computed: String },

    /// The ambient lock id does not match the node's current lock.
    #[error("locked: {message}")]
    Locked { message: String },

    /// Completing this write would exceed the space's quota.
    #[error("quota exceeded: requested {requested} remaining {remaining}")]
    QuotaExceeded { requested: u64, remaining: u64 },

    /// The lock's retry budget was exhausted before the OS lock was granted.
    #[error("lock unavailable on {path:?} after {attempts} attempts")]
    LockUnavailable { path: PathBuf, attempts: u32 },

    /// A required field was missing or malformed in a request.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Serialization, I/O, or an internal invariant failed unexpectedly.
    #[error("internal error: {message}")]
    Internal { message: String },

    /// An attribute key has no value. Internal to the metadata backends;
    /// callers at the node-store boundary convert this into `NotFound`.
    #[error("no attribute: {key}")]
    NoAttribute { key: String },
}

impl AppError {
    /// Converts a `NoAttribute` miss into a `NotFound`, the conversion
    /// callers outside the metadata backend are expected to apply.
    pub fn attribute_not_found(self) -> Self {
        match self {
            AppError::NoAttribute { key } => AppError::NotFound {
                message: format!("attribute not found: {key}"),
            },
            other => other,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        AppError::NotFound {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        AppError::Internal {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => AppError::NotFound {
                message: err.to_string(),
            },
            std::io::ErrorKind::AlreadyExists => AppError::AlreadyExists {
                path: PathBuf::new(),
            },
            _ => AppError::Internal {
                message: err.to_string(),
            },
        }
    }
}

impl From<uuid::Error> for AppError {
    fn from(err: uuid::Error) -> Self {
        AppError::Validation {
            message: format!("invalid uuid: {err}"),
        }
    }
}

impl From<rmp_serde::encode::Error> for AppError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        AppError::Internal {
            message: format!("messagepack encode failed: {err}"),
        }
    }
}

impl From<rmp_serde::decode::Error> for AppError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        AppError::Internal {
            message: format!("messagepack decode failed: {err}"),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal {
            message: format!("json (de)serialization failed: {err}"),
        }
    }
}

/// Type alias for results using the engine's error type.
pub type AppResult<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_not_found_converts_to_not_found() {
        let err = AppError::NoAttribute {
            key: "cs.sha1".into(),
        }
        .attribute_not_found();
        assert!(matches!(err, AppError::NotFound { .. }));
    }

    #[test]
    fn attribute_not_found_is_noop_on_other_variants() {
        let err = AppError::Locked {
            message: "held".into(),
        }
        .attribute_not_found();
        assert!(matches!(err, AppError::Locked { .. }));
    }
}
