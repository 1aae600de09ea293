//! # Metadata Backends (C2)
//!
//! Node attributes — `md.*`, `cs.*`, `fav.*`, `grant.*`, `tmtime`,
//! `treesize`, lock tokens — are stored through one of three pluggable
//! backends, selected per space at creation time:
//!
//! - [`xattr`] — native POSIX extended attributes, zero extra files, but
//!   unavailable on filesystems that don't support them (tmpfs overlays,
//!   some network mounts).
//! - [`ini`] — one `.meta.ini` side-car per node, human-inspectable.
//! - [`msgpack`] — one `.meta.mp` side-car per node, compact and the
//!   engine default.
//!
//! All three implement [`MetadataBackend`], so the rest of the engine
//! never branches on which one is active.

pub mod ini;
pub mod msgpack;
pub mod xattr;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::errors::AppResult;
use crate::locks::LockGuard;

/// Which [`MetadataBackend`] implementation a space uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataBackendKind {
    Xattr,
    Ini,
    MsgPack,
}

impl MetadataBackendKind {
    /// Parses a backend name from configuration, case-insensitively.
    /// Returns `None` for anything unrecognized so callers can fall back
    /// to a default rather than panic on a typo'd env var.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "xattr" => Some(Self::Xattr),
            "ini" => Some(Self::Ini),
            "msgpack" | "messagepack" | "rmp" => Some(Self::MsgPack),
            _ => None,
        }
    }

    /// Builds the concrete backend this kind names.
    pub fn build(self) -> Arc<dyn MetadataBackend> {
        match self {
            Self::Xattr => Arc::new(xattr::XattrBackend::new()),
            Self::Ini => Arc::new(ini::IniBackend::new()),
            Self::MsgPack => Arc::new(msgpack::MsgPackBackend::new()),
        }
    }
}

/// Uniform attribute store over a node's on-disk path.
///
/// Keys are opaque byte-string-valued; callers (node store, propagator,
/// upload engine) impose the `md.*`/`cs.*`/`tmtime` namespacing. All
/// methods operate on `node_path`, the node's real (non-sharded-lookup)
/// path on disk — backends that use side-car files derive the side-car
/// path from it themselves via [`MetadataBackend::metadata_path`].
#[async_trait]
pub trait MetadataBackend: Send + Sync {
    /// Returns every attribute currently stored on `node_path`.
    async fn all(&self, node_path: &Path) -> AppResult<HashMap<String, Vec<u8>>>;

    /// Reads a single attribute. Returns [`crate::errors::AppError::NoAttribute`]
    /// if `key` is unset; callers at a public surface (e.g.
    /// [`crate::space::Space::attribute`]) convert that into `NotFound`
    /// via [`crate::errors::AppError::attribute_not_found`].
    async fn get(&self, node_path: &Path, key: &str) -> AppResult<Vec<u8>>;

    /// Reads an attribute and parses it as a decimal-string `i64`, the
    /// encoding `treesize`/`quota` use (spec.md §6).
    async fn get_int64(&self, node_path: &Path, key: &str) -> AppResult<i64> {
        let raw = self.get(node_path, key).await?;
        let text = std::str::from_utf8(&raw)
            .map_err(|e| crate::errors::AppError::internal(format!("int64 attribute not utf8: {e}")))?;
        text.trim()
            .parse()
            .map_err(|e| crate::errors::AppError::internal(format!("int64 attribute malformed: {e}")))
    }

    /// Lists attribute keys matching `prefix` (e.g. `"cs."`).
    async fn list(&self, node_path: &Path, prefix: &str) -> AppResult<Vec<String>>;

    /// Sets a single attribute, creating the backing store if absent.
    /// `lock` witnesses that the caller already holds an exclusive lock
    /// on `node_path` (spec.md §4.1, §4.2, §9); backends trust the
    /// witness rather than re-acquiring their own lock, which would
    /// deadlock against a caller that already holds one.
    async fn set(&self, node_path: &Path, key: &str, value: &[u8], lock: &LockGuard) -> AppResult<()>;

    /// Sets several attributes as one logical write; side-car backends
    /// perform this as a single file rewrite to avoid partial updates
    /// being observable.
    async fn set_multiple(&self, node_path: &Path, values: &[(&str, &[u8])], lock: &LockGuard) -> AppResult<()> {
        for (key, value) in values {
            self.set(node_path, key, value, lock).await?;
        }
        Ok(())
    }

    /// Removes a single attribute. A no-op if the key was already unset.
    async fn remove(&self, node_path: &Path, key: &str) -> AppResult<()>;

    /// Deletes every attribute associated with `node_path`, including any
    /// side-car file. Called when the node itself is deleted.
    async fn purge(&self, node_path: &Path) -> AppResult<()>;

    /// Moves a node's attribute storage from `from` to `to`, called
    /// alongside the node store's own rename so side-car files follow
    /// their node.
    async fn rename(&self, from: &Path, to: &Path) -> AppResult<()>;

    /// Path to the backing side-car file for `node_path`, or `node_path`
    /// itself for backends with no side-car (xattr). Used by the node
    /// store to exclude metadata files from child listings.
    fn metadata_path(&self, node_path: &Path) -> PathBuf;

    /// True if `path` is itself a metadata side-car file and should be
    /// hidden from directory listings of node children.
    fn is_meta_file(&self, path: &Path) -> bool;
}

/// In-process cache keyed by node path, invalidated by comparing the
/// node file's mtime against the mtime recorded at cache time. Shared by
/// the side-car backends, which otherwise re-parse their side-car file
/// on every attribute read.
///
/// No extra crate is needed for this: it's a `parking_lot::RwLock`
/// around a `HashMap`, the same shape `echo`'s upload tracker uses for
/// its shared in-memory state.
#[derive(Default)]
pub struct MetaCache {
    entries: RwLock<HashMap<PathBuf, (SystemTime, HashMap<String, Vec<u8>>)>>,
}

impl MetaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached attribute map for `path` if `current_mtime`
    /// still matches what was cached.
    pub fn get(&self, path: &Path, current_mtime: SystemTime) -> Option<HashMap<String, Vec<u8>>> {
        let entries = self.entries.read();
        entries.get(path).and_then(|(cached_mtime, map)| {
            if *cached_mtime == current_mtime {
                Some(map.clone())
            } else {
                None
            }
        })
    }

    /// Replaces the cached entry for `path`.
    pub fn put(&self, path: PathBuf, mtime: SystemTime, map: HashMap<String, Vec<u8>>) {
        self.entries.write().insert(path, (mtime, map));
    }

    /// Drops any cached entry for `path`, forcing the next read to go to
    /// disk. Called after every write and on rename/purge.
    pub fn invalidate(&self, path: &Path) {
        self.entries.write().remove(path);
    }

    /// Moves a cache entry from `from` to `to`, if present, matching a
    /// backend rename.
    pub fn rename(&self, from: &Path, to: &Path) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.remove(from) {
            entries.insert(to.to_path_buf(), entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_known_names_case_insensitively() {
        assert_eq!(
            MetadataBackendKind::parse("XATTR"),
            Some(MetadataBackendKind::Xattr)
        );
        assert_eq!(
            MetadataBackendKind::parse("messagepack"),
            Some(MetadataBackendKind::MsgPack)
        );
        assert_eq!(MetadataBackendKind::parse("bogus"), None);
    }

    #[test]
    fn meta_cache_round_trips_until_mtime_changes() {
        let cache = MetaCache::new();
        let path = PathBuf::from("/tmp/node");
        let mtime = SystemTime::UNIX_EPOCH;
        let mut map = HashMap::new();
        map.insert("md.name".to_string(), b"hello".to_vec());

        cache.put(path.clone(), mtime, map.clone());
        assert_eq!(cache.get(&path, mtime), Some(map));

        let later = mtime + std::time::Duration::from_secs(1);
        assert_eq!(cache.get(&path, later), None);
    }

    #[test]
    fn meta_cache_invalidate_drops_entry() {
        let cache = MetaCache::new();
        let path = PathBuf::from("/tmp/node");
        let mtime = SystemTime::UNIX_EPOCH;
        cache.put(path.clone(), mtime, HashMap::new());
        cache.invalidate(&path);
        assert_eq!(cache.get(&path, mtime), None);
    }
}
