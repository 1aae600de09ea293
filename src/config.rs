//! # Configuration
//!
//! Runtime configuration for the storage engine. Values come from
//! environment variables with documented defaults, following the same
//! struct-of-fields-plus-`Default` shape the rest of this crate uses for
//! configuration-like types.
//!
//! ## Configuration Sources
//!
//! 1. **Environment variables** — `STORAGE_ROOT`, `STORAGE_MAX_FILE_SIZE`,
//!    `STORAGE_CHUNK_SIZE`, `STORAGE_METADATA_BACKEND`, `STORAGE_LOCK_RETRY_ATTEMPTS`,
//!    `STORAGE_LOCK_RETRY_INITIAL_DELAY_MS`.
//! 2. **Defaults** — used for any variable that is unset or unparsable.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::metadata::MetadataBackendKind;

/// Default maximum file size (10GiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Default chunk part size for streamed uploads (16MiB, spec.md §4.9).
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Default lock retry attempt budget (spec.md §4.1).
pub const DEFAULT_LOCK_RETRY_ATTEMPTS: u32 = 10;

/// Default initial lock retry backoff, in milliseconds (spec.md §4.1).
pub const DEFAULT_LOCK_RETRY_INITIAL_DELAY_MS: u64 = 3;

/// Engine-wide configuration.
///
/// All fields are public to allow easy access throughout the engine, in the
/// same spirit as the rest of this crate's configuration types.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Root directory under which `spaces/`, `indexes/`, and `uploads/`
    /// live (spec.md §6).
    pub root_dir: PathBuf,

    /// Maximum allowed file size in bytes. Uploads declaring a larger
    /// size are rejected at `Open` with `FileSizeExceeded`.
    pub max_file_size: u64,

    /// Size of individual upload chunk parts, in bytes.
    pub chunk_size: usize,

    /// Which metadata backend new spaces use by default.
    pub metadata_backend: MetadataBackendKind,

    /// Number of attempts `locks::LockManager` makes before giving up with
    /// `LockUnavailable`.
    pub lock_retry_attempts: u32,

    /// Initial backoff before the first retry, doubled on each subsequent
    /// attempt.
    pub lock_retry_initial_delay_ms: u64,
}

impl Default for Config {
    /// Default values favor correctness on commodity POSIX filesystems:
    /// MessagePack metadata (portable across filesystems that lack xattr
    /// support), 10GiB uploads in 16MiB chunks.
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./storage-data"),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            metadata_backend: MetadataBackendKind::MsgPack,
            lock_retry_attempts: DEFAULT_LOCK_RETRY_ATTEMPTS,
            lock_retry_initial_delay_ms: DEFAULT_LOCK_RETRY_INITIAL_DELAY_MS,
        }
    }
}

impl Config {
    /// Loads configuration from the process environment, falling back to
    /// [`Config::default`] for any variable that is unset or fails to
    /// parse.
    pub fn load() -> Self {
        let defaults = Self::default();

        Self {
            root_dir: std::env::var("STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.root_dir),
            max_file_size: std::env::var("STORAGE_MAX_FILE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_file_size),
            chunk_size: std::env::var("STORAGE_CHUNK_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.chunk_size),
            metadata_backend: std::env::var("STORAGE_METADATA_BACKEND")
                .ok()
                .and_then(|v| MetadataBackendKind::parse(&v))
                .unwrap_or(defaults.metadata_backend),
            lock_retry_attempts: std::env::var("STORAGE_LOCK_RETRY_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.lock_retry_attempts),
            lock_retry_initial_delay_ms: std::env::var("STORAGE_LOCK_RETRY_INITIAL_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.lock_retry_initial_delay_ms),
        }
    }
}
