//! # Node Timestamps (C5)
//!
//! Every node carries four timestamps (spec.md §4.5):
//!
//! - `mtime` — last write to the node's own content or direct attributes,
//!   stored as an RFC3339 attribute; falls back to the filesystem's own
//!   `lstat` mtime when never set.
//! - `tmtime` — tree mtime: the most recent `mtime` anywhere in the
//!   node's subtree, maintained by [`crate::propagator`]; falls back to
//!   [`read_mtime`] when never set.
//! - `ctime` — node creation time. Read directly from the filesystem's
//!   `lstat`, never stored as an attribute.
//! - `dtime` — deletion time, set only on tombstoned nodes; genuinely
//!   absent (not a fallback chain) on a live node.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::errors::{AppError, AppResult};
use crate::locks::LockGuard;
use crate::metadata::MetadataBackend;

pub const KEY_MTIME: &str = "mtime";
pub const KEY_TMTIME: &str = "tmtime";
pub const KEY_DTIME: &str = "dtime";

/// Formats `when` as RFC3339 with nanosecond precision, the wire format
/// every timestamp attribute uses.
pub fn format_timestamp(when: DateTime<Utc>) -> String {
    when.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parses an RFC3339 timestamp previously produced by
/// [`format_timestamp`].
pub fn parse_timestamp(raw: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::internal(format!("invalid timestamp {raw:?}: {e}")))
}

async fn read_time_opt(
    backend: &dyn MetadataBackend,
    node_path: &Path,
    key: &str,
) -> AppResult<Option<DateTime<Utc>>> {
    match backend.get(node_path, key).await {
        Ok(raw) => {
            let text = String::from_utf8(raw)
                .map_err(|e| AppError::internal(format!("non-utf8 timestamp: {e}")))?;
            Ok(Some(parse_timestamp(&text)?))
        }
        Err(AppError::NoAttribute { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

async fn write_time(
    backend: &dyn MetadataBackend,
    node_path: &Path,
    key: &str,
    when: DateTime<Utc>,
    lock: &LockGuard,
) -> AppResult<()> {
    backend
        .set(node_path, key, format_timestamp(when).as_bytes(), lock)
        .await
}

/// Reads the node's `mtime` attribute, falling back to the filesystem's
/// own `lstat` mtime when the attribute was never set (spec.md §4.5).
pub async fn read_mtime(backend: &dyn MetadataBackend, node_path: &Path) -> AppResult<DateTime<Utc>> {
    if let Some(when) = read_time_opt(backend, node_path, KEY_MTIME).await? {
        return Ok(when);
    }
    let meta = tokio::fs::symlink_metadata(node_path).await?;
    let modified = meta
        .modified()
        .map_err(|e| AppError::internal(format!("lstat mtime unavailable: {e}")))?;
    Ok(DateTime::<Utc>::from(modified))
}

pub async fn write_mtime(
    backend: &dyn MetadataBackend,
    node_path: &Path,
    when: DateTime<Utc>,
    lock: &LockGuard,
) -> AppResult<()> {
    write_time(backend, node_path, KEY_MTIME, when, lock).await
}

/// Reads the node's `tmtime` attribute, falling back to [`read_mtime`]
/// when no tree-mtime has ever been recorded (spec.md §4.5).
pub async fn read_tmtime(backend: &dyn MetadataBackend, node_path: &Path) -> AppResult<DateTime<Utc>> {
    if let Some(when) = read_time_opt(backend, node_path, KEY_TMTIME).await? {
        return Ok(when);
    }
    read_mtime(backend, node_path).await
}

pub async fn write_tmtime(
    backend: &dyn MetadataBackend,
    node_path: &Path,
    when: DateTime<Utc>,
    lock: &LockGuard,
) -> AppResult<()> {
    write_time(backend, node_path, KEY_TMTIME, when, lock).await
}

/// Reads the node's creation time directly off the filesystem. Unlike
/// the other three timestamps, `ctime` is never stored as an attribute
/// (spec.md §4.5) — it isn't something this engine can choose to set.
pub async fn read_ctime(node_path: &Path) -> AppResult<DateTime<Utc>> {
    use std::os::unix::fs::MetadataExt;
    let meta = tokio::fs::symlink_metadata(node_path).await?;
    let secs = meta.ctime();
    let nanos = meta.ctime_nsec() as u32;
    DateTime::from_timestamp(secs, nanos).ok_or_else(|| AppError::internal("ctime out of range"))
}

pub async fn read_dtime(backend: &dyn MetadataBackend, node_path: &Path) -> AppResult<Option<DateTime<Utc>>> {
    read_time_opt(backend, node_path, KEY_DTIME).await
}

pub async fn write_dtime(
    backend: &dyn MetadataBackend,
    node_path: &Path,
    when: DateTime<Utc>,
    lock: &LockGuard,
) -> AppResult<()> {
    write_time(backend, node_path, KEY_DTIME, when, lock).await
}

/// Applies max-merge semantics for `tmtime`: writes `candidate` only if
/// it is more recent than whatever `tmtime` currently holds. Returns
/// whether a write happened, so the propagator knows whether to keep
/// walking up the tree.
pub async fn bump_tmtime(
    backend: &dyn MetadataBackend,
    node_path: &Path,
    candidate: DateTime<Utc>,
    lock: &LockGuard,
) -> AppResult<bool> {
    let current = read_tmtime(backend, node_path).await?;
    if candidate > current {
        write_tmtime(backend, node_path, candidate, lock).await?;
        Ok(true)
    } else {
        Ok(false)
    }
}
