//! # Upload Session Store (C8)
//!
//! Persists the resumable-upload state described in spec.md §3 as a JSON
//! side-car (`<upload-id>.info`) plus a sibling staging binary
//! (`<upload-id>`), both under `<root>/uploads/`.

pub mod engine;
pub mod postprocessing;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::AppResult;

/// Snapshot of the identity a request is running on behalf of.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Executant {
    pub idp: String,
    pub id: String,
    pub user_type: String,
    pub username: String,
}

/// Optimistic-concurrency and existence preconditions carried on the
/// session (spec.md §3, §4.9).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Preconditions {
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub if_unmodified_since: Option<String>,
}

/// Marshalled state of the three running hashers, persisted so a
/// process restart mid-upload can resume hashing without re-reading
/// already-written bytes (spec.md §8 invariant 4).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HasherState {
    pub sha1: Vec<u8>,
    pub md5: Vec<u8>,
    pub adler32: u32,
}

/// Resumable upload session (spec.md §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub upload_id: String,
    pub space_id: String,
    pub parent_id: String,
    /// Empty for new files; set when this upload overwrites an existing
    /// node.
    pub node_id: Option<String>,
    pub filename: String,
    /// `None` means the client deferred declaring a final size.
    pub size: Option<u64>,
    pub offset: u64,
    /// Starting offset of every persisted chunk, strictly ascending.
    pub blob_offsets: Vec<u64>,
    pub hasher_state: HasherState,
    pub preconditions: Preconditions,
    pub lock_id: Option<String>,
    pub mtime: Option<DateTime<Utc>>,
    pub executant: Executant,
    pub space_owner_id: Option<String>,
    pub revision_timestamp: Option<DateTime<Utc>>,
    pub cancelled: bool,
    pub postprocessing_checkpoint: Option<String>,
    pub expires: Option<DateTime<Utc>>,
}

impl Session {
    /// Path of this session's JSON side-car under `root`. Kept at the
    /// global `<root>/uploads/` level, keyed by upload id alone, since a
    /// session must be locatable before its space id is known.
    pub fn info_path(&self, root: &Path) -> PathBuf {
        info_path(root, &self.upload_id)
    }

    /// Path of this session's staging binary, under the hidden
    /// `.oc-tmp/` directory of its own space (spec.md §4.3, §6).
    pub fn bin_path(&self, root: &Path) -> PathBuf {
        crate::node::path::tmp_dir(root, &self.space_id).join(&self.upload_id)
    }
}

fn uploads_dir(root: &Path) -> PathBuf {
    root.join("uploads")
}

fn info_path(root: &Path, upload_id: &str) -> PathBuf {
    uploads_dir(root).join(format!("{upload_id}.info"))
}

/// C8 contract: persist/read/touch/purge an upload session.
#[async_trait]
pub trait UploadSessionStore: Send + Sync {
    async fn persist(&self, session: &Session) -> AppResult<()>;
    async fn read(&self, upload_id: &str) -> AppResult<Session>;
    /// Creates the empty staging binary for a brand-new upload.
    async fn touch_bin(&self, session: &Session) -> AppResult<()>;
    /// Removes both the side-car and the staging binary.
    async fn purge(&self, session: &Session) -> AppResult<()>;
    /// Lists sessions whose `expires` timestamp has passed, for GC.
    async fn list_expired(&self, now: DateTime<Utc>) -> AppResult<Vec<String>>;
}

/// [`UploadSessionStore`] backed by the local filesystem.
pub struct LocalUploadSessionStore {
    root: PathBuf,
}

impl LocalUploadSessionStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl UploadSessionStore for LocalUploadSessionStore {
    async fn persist(&self, session: &Session) -> AppResult<()> {
        let dir = uploads_dir(&self.root);
        tokio::fs::create_dir_all(&dir).await?;
        let bytes = serde_json::to_vec_pretty(session)?;
        let path = session.info_path(&self.root);
        let tmp = path.with_extension("info.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read(&self, upload_id: &str) -> AppResult<Session> {
        let path = info_path(&self.root, upload_id);
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                crate::errors::AppError::not_found(format!("upload session {upload_id} not found"))
            } else {
                e.into()
            }
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn touch_bin(&self, session: &Session) -> AppResult<()> {
        let path = session.bin_path(&self.root);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::File::create(&path).await?;
        Ok(())
    }

    async fn purge(&self, session: &Session) -> AppResult<()> {
        let info = session.info_path(&self.root);
        let bin = session.bin_path(&self.root);
        for path in [info, bin] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> AppResult<Vec<String>> {
        let dir = uploads_dir(&self.root);
        let mut expired = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(expired),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("info") {
                continue;
            }
            let Ok(bytes) = tokio::fs::read(&path).await else {
                continue;
            };
            let Ok(session) = serde_json::from_slice::<Session>(&bytes) else {
                continue;
            };
            if let Some(expires) = session.expires {
                if expires <= now {
                    expired.push(session.upload_id);
                }
            }
        }
        Ok(expired)
    }
}
