//! # Upload Engine (C9)
//!
//! Drives `Open` → `WriteChunk` → `Finish` for a resumable chunked
//! upload (spec.md §4.9): precondition checks, streaming checksums,
//! quota enforcement, and revision materialisation under an exclusive
//! lock on the target node.

use std::path::PathBuf;
use std::sync::Arc;

use adler32::RollingAdler32;
use chrono::{DateTime, Utc};
use digest::Digest;
use md5::Md5;
use sha1::Sha1;
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::constants::*;
use crate::errors::{AppError, AppResult};
use crate::events::{BytesReceived, Event, EventSink};
use crate::locks::LockManager;
use crate::metadata::MetadataBackend;
use crate::node::{path as node_path, Node, NodeStore, ResourceType};
use crate::upload::{Executant, HasherState, Preconditions, Session, UploadSessionStore};

/// Default chunk part size (spec.md §4.9): 16MiB.
pub const DEFAULT_PART_SIZE: usize = 16 * 1024 * 1024;

/// Parameters for [`UploadEngine::open`].
pub struct OpenRequest {
    pub space_id: String,
    /// Logical directory the file lives in, e.g. `"/"` or `"/a/b"`.
    pub dir: String,
    pub filename: String,
    /// `None` means the client deferred declaring a final size.
    pub size: Option<u64>,
    pub lock_id: Option<String>,
    pub preconditions: Preconditions,
    pub executant: Executant,
    pub mtime: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
}

/// Outcome of a successful [`UploadEngine::finish`]: the node is
/// already materialised and marked `processing`; C10 decides whether to
/// commit, revert, or delete it.
pub struct FinishOutcome {
    pub upload_id: String,
    pub node: Node,
    pub revision_path: Option<PathBuf>,
    pub size_diff: i64,
}

/// C9: chunk reception, streaming checksum, revision materialisation,
/// precondition checks.
pub struct UploadEngine {
    root: PathBuf,
    node_store: Arc<dyn NodeStore>,
    backend: Arc<dyn MetadataBackend>,
    blob_store: Arc<dyn BlobStore>,
    locks: LockManager,
    sessions: Arc<dyn UploadSessionStore>,
    max_file_size: u64,
    events: Arc<dyn EventSink>,
}

impl UploadEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        root: PathBuf,
        node_store: Arc<dyn NodeStore>,
        backend: Arc<dyn MetadataBackend>,
        blob_store: Arc<dyn BlobStore>,
        locks: LockManager,
        sessions: Arc<dyn UploadSessionStore>,
        max_file_size: u64,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            root,
            node_store,
            backend,
            blob_store,
            locks,
            sessions,
            max_file_size,
            events,
        }
    }

    /// Opens a new upload session, checking every precondition spec.md
    /// §4.9 lists before any bytes are accepted.
    pub async fn open(&self, req: OpenRequest) -> AppResult<Session> {
        if req.filename.is_empty() {
            return Err(AppError::Validation {
                message: "filename must not be empty".to_string(),
            });
        }

        let parent = self
            .node_store
            .node_from_resource(&req.space_id, None, Some(&req.dir), None)
            .await?;

        let existing = self.node_store.child(&parent, &req.filename).await.ok();

        if let Some(existing) = &existing {
            if existing.resource_type == ResourceType::Container {
                return Err(AppError::PreconditionFailed {
                    message: format!("{} is a directory", req.filename),
                });
            }
            self.check_lock(existing, req.lock_id.as_deref()).await?;
            self.check_preconditions(existing, &req.preconditions).await?;
        } else if req.preconditions.if_match.is_some() {
            return Err(AppError::Aborted {
                message: "if-match set but target does not exist".to_string(),
            });
        }

        if let Some(size) = req.size {
            if size > self.max_file_size {
                return Err(AppError::QuotaExceeded {
                    requested: size,
                    remaining: self.max_file_size,
                });
            }
        }

        let upload_id = Uuid::new_v4().to_string();
        let session = Session {
            upload_id: upload_id.clone(),
            space_id: req.space_id,
            parent_id: parent.id,
            node_id: existing.map(|n| n.id),
            filename: req.filename,
            size: req.size,
            offset: 0,
            blob_offsets: Vec::new(),
            hasher_state: HasherState::default(),
            preconditions: req.preconditions,
            lock_id: req.lock_id,
            mtime: req.mtime,
            executant: req.executant,
            space_owner_id: None,
            revision_timestamp: None,
            cancelled: false,
            postprocessing_checkpoint: None,
            expires: req.expires,
        };

        self.sessions.touch_bin(&session).await?;
        self.sessions.persist(&session).await?;
        Ok(session)
    }

    async fn check_lock(&self, node: &Node, declared_lock_id: Option<&str>) -> AppResult<()> {
        let current = match self.backend.get(&node.path, ATTR_LOCK_ID).await {
            Ok(raw) => Some(String::from_utf8_lossy(&raw).to_string()),
            Err(AppError::NoAttribute { .. }) => None,
            Err(e) => return Err(e),
        };
        match (current, declared_lock_id) {
            (None, _) => Ok(()),
            (Some(_), None) => Err(AppError::Locked {
                message: "node is locked but no lock id was supplied".to_string(),
            }),
            (Some(held), Some(declared)) if held == declared => Ok(()),
            (Some(_), Some(_)) => Err(AppError::Locked {
                message: "declared lock id does not match node's current lock".to_string(),
            }),
        }
    }

    async fn check_preconditions(&self, node: &Node, pre: &Preconditions) -> AppResult<()> {
        let mtime = crate::time::read_mtime(self.backend.as_ref(), &node.path).await?;
        let etag = compute_etag(&node.id, &crate::time::format_timestamp(mtime));

        if let Some(if_none_match) = &pre.if_none_match {
            if if_none_match == "*" {
                return Err(AppError::AlreadyExists {
                    path: node.path.clone(),
                });
            }
            if if_none_match == &etag {
                return Err(AppError::Aborted {
                    message: "if-none-match matched current etag".to_string(),
                });
            }
        }
        if let Some(if_match) = &pre.if_match {
            if if_match != &etag {
                return Err(AppError::Aborted {
                    message: "if-match did not match current etag".to_string(),
                });
            }
        }
        if let Some(if_unmodified_since) = &pre.if_unmodified_since {
            let threshold = crate::time::parse_timestamp(if_unmodified_since)?;
            if mtime > threshold {
                return Err(AppError::Aborted {
                    message: "node modified after if-unmodified-since".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Writes one chunk at `chunk_offset`, which must equal the
    /// session's current offset (chunks are written in order). Updates
    /// the running checksums and persists the session.
    pub async fn write_chunk(&self, upload_id: &str, chunk_offset: u64, bytes: &[u8]) -> AppResult<Session> {
        let mut session = self.sessions.read(upload_id).await?;
        if session.cancelled {
            return Err(AppError::Aborted {
                message: "upload was cancelled".to_string(),
            });
        }
        if chunk_offset != session.offset {
            return Err(AppError::PreconditionFailed {
                message: format!(
                    "chunk offset {chunk_offset} does not match session offset {}",
                    session.offset
                ),
            });
        }

        let bin_path = session.bin_path(&self.root);
        write_at(&bin_path, chunk_offset, bytes).await?;

        session.blob_offsets.push(chunk_offset);
        session.offset += bytes.len() as u64;
        session.hasher_state = hash_file_prefix(&bin_path, session.offset).await?;

        self.sessions.persist(&session).await?;

        self.events
            .emit(Event::BytesReceived(BytesReceived {
                upload_id: session.upload_id.clone(),
                space_id: session.space_id.clone(),
                offset: session.offset,
                executant: session.executant.clone(),
            }))
            .await;

        Ok(session)
    }

    /// Finalises a session: validates the declared checksum, then
    /// materialises the target node (new or revision) under an
    /// exclusive lock. The post-processing pipeline (C10) decides what
    /// happens to this outcome next.
    pub async fn finish(&self, upload_id: &str, declared_checksum: Option<&str>) -> AppResult<FinishOutcome> {
        let session = self.sessions.read(upload_id).await?;

        if let Some(declared) = declared_checksum {
            self.verify_checksum(&session, declared)?;
        }

        let parent = self
            .node_store
            .from_id(&session.space_id, &session.parent_id)
            .await?;

        match &session.node_id {
            None => self.finish_create(&session, &parent).await,
            Some(node_id) => self.finish_overwrite(&session, node_id).await,
        }
    }

    fn verify_checksum(&self, session: &Session, declared: &str) -> AppResult<()> {
        let (alg, hex_digest) = declared
            .split_once(' ')
            .ok_or_else(|| AppError::Validation {
                message: format!("malformed checksum declaration {declared:?}"),
            })?;

        let computed = match alg {
            "sha1" => hex::encode(&session.hasher_state.sha1),
            "md5" => hex::encode(&session.hasher_state.md5),
            "adler32" => format!("{:08x}", session.hasher_state.adler32),
            other => {
                return Err(AppError::Validation {
                    message: format!("unsupported checksum algorithm {other:?}"),
                })
            }
        };

        if computed != hex_digest {
            return Err(AppError::ChecksumMismatch {
                declared: hex_digest.to_string(),
                computed,
            });
        }
        Ok(())
    }

    async fn finish_create(&self, session: &Session, parent: &Node) -> AppResult<FinishOutcome> {
        let node = self
            .node_store
            .create(parent, &session.filename, ResourceType::File)
            .await?;

        let guard = self.locks.acquire(&node_path::lock_path_for(&node.path)).await?;
        self.backend
            .set_multiple(
                &node.path,
                &[
                    (ATTR_BLOB_ID, session.upload_id.as_bytes()),
                    (ATTR_BLOB_SIZE, session.offset.to_string().as_bytes()),
                    (ATTR_CS_SHA1, hex::encode(&session.hasher_state.sha1).as_bytes()),
                    (ATTR_CS_MD5, hex::encode(&session.hasher_state.md5).as_bytes()),
                    (
                        ATTR_CS_ADLER32,
                        format!("{:08x}", session.hasher_state.adler32).as_bytes(),
                    ),
                    (
                        ATTR_NODESTATUS,
                        format!("{NODESTATUS_PROCESSING_PREFIX}{}", session.upload_id).as_bytes(),
                    ),
                ],
                &guard,
            )
            .await?;
        crate::time::write_mtime(self.backend.as_ref(), &node.path, Utc::now(), &guard).await?;

        Ok(FinishOutcome {
            upload_id: session.upload_id.clone(),
            size_diff: session.offset as i64,
            node,
            revision_path: None,
        })
    }

    async fn finish_overwrite(&self, session: &Session, node_id: &str) -> AppResult<FinishOutcome> {
        let node = self.node_store.from_id(&session.space_id, node_id).await?;
        self.check_preconditions(&node, &session.preconditions).await?;

        let lock_path = node_path::lock_path_for(&node.path);
        let guard = self.locks.acquire(&lock_path).await?;

        let old_blob_size = node.blob_size;
        let old_mtime = crate::time::read_mtime(self.backend.as_ref(), &node.path).await?;
        let old_mtime_text = crate::time::format_timestamp(old_mtime);

        let mut revision_name = node.path.file_name().unwrap_or_default().to_os_string();
        revision_name.push(format!(".REV.{old_mtime_text}"));
        let revision_path = node.path.with_file_name(revision_name);
        tokio::fs::File::create(&revision_path).await?;
        let revision_guard = self.locks.acquire(&node_path::lock_path_for(&revision_path)).await?;

        let keep_keys = [ATTR_CS_SHA1, ATTR_CS_MD5, ATTR_CS_ADLER32, ATTR_BLOB_ID, ATTR_BLOB_SIZE];
        for key in keep_keys {
            if let Ok(value) = self.backend.get(&node.path, key).await {
                self.backend.set(&revision_path, key, &value, &revision_guard).await?;
            }
        }
        revision_guard.release();

        let size_diff = session.offset as i64 - old_blob_size as i64;

        self.backend
            .set_multiple(
                &node.path,
                &[
                    (ATTR_BLOB_ID, session.upload_id.as_bytes()),
                    (ATTR_BLOB_SIZE, session.offset.to_string().as_bytes()),
                    (ATTR_CS_SHA1, hex::encode(&session.hasher_state.sha1).as_bytes()),
                    (ATTR_CS_MD5, hex::encode(&session.hasher_state.md5).as_bytes()),
                    (
                        ATTR_CS_ADLER32,
                        format!("{:08x}", session.hasher_state.adler32).as_bytes(),
                    ),
                    (
                        ATTR_NODESTATUS,
                        format!("{NODESTATUS_PROCESSING_PREFIX}{}", session.upload_id).as_bytes(),
                    ),
                ],
                &guard,
            )
            .await?;
        crate::time::write_mtime(self.backend.as_ref(), &node.path, Utc::now(), &guard).await?;

        Ok(FinishOutcome {
            upload_id: session.upload_id.clone(),
            size_diff,
            node,
            revision_path: Some(revision_path),
        })
    }

    /// Moves the staging blob into its blob-id-addressed location under
    /// the space's `blobs/` tree (spec.md §4.3), setting the blob file's
    /// OS-level mtime to the session's declared mtime, falling back to
    /// the node's own `mtime` attribute when none was declared (spec.md
    /// §4.9). Called by C10's `assembling` step on a `continue` outcome.
    pub async fn commit_blob(&self, session: &Session, node: &Node) -> AppResult<()> {
        let guard = self.locks.acquire(&node_path::lock_path_for(&node.path)).await?;

        let staged = session.bin_path(&self.root);
        let dest = node_path::blob_path(&self.root, &node.space_id, &session.upload_id);
        self.blob_store.finalize(&staged, &dest).await?;

        let mtime = match session.mtime {
            Some(mtime) => mtime,
            None => crate::time::read_mtime(self.backend.as_ref(), &node.path).await?,
        };
        let unix = filetime::FileTime::from_unix_time(mtime.timestamp(), mtime.timestamp_subsec_nanos());
        filetime::set_file_mtime(&dest, unix)?;

        guard.release();
        Ok(())
    }

    /// Clears the `processing` marker left by [`Self::finish`].
    pub async fn clear_processing_marker(&self, node: &Node) -> AppResult<()> {
        self.backend.remove(&node.path, ATTR_NODESTATUS).await
    }

    /// Rolls a node's checksum/blob attributes back to what a revision
    /// created by [`Self::finish_overwrite`] recorded, then removes the
    /// revision file. Used on an `abort` outcome for an overwrite: the
    /// node already carries the new attributes by the time C10 runs, so
    /// aborting means restoring the old ones rather than merely deleting
    /// the backup.
    pub async fn discard_revision(&self, node: &Node, revision_path: &std::path::Path) -> AppResult<()> {
        let guard = self.locks.acquire(&node_path::lock_path_for(&node.path)).await?;
        let keep_keys = [ATTR_CS_SHA1, ATTR_CS_MD5, ATTR_CS_ADLER32, ATTR_BLOB_ID, ATTR_BLOB_SIZE];
        for key in keep_keys {
            match self.backend.get(revision_path, key).await {
                Ok(value) => self.backend.set(&node.path, key, &value, &guard).await?,
                Err(AppError::NoAttribute { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        self.backend.purge(revision_path).await?;
        match tokio::fs::remove_file(revision_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes a node created by [`Self::finish_create`] when C10 aborts
    /// or deletes an upload with no prior revision to roll back to:
    /// unlinks it from its parent, then purges the node itself, so no
    /// dangling child link is left behind.
    pub async fn reject_created_node(&self, node: &Node) -> AppResult<()> {
        self.node_store.delete(node, &format!("/{}", node.name)).await?;
        self.node_store.purge(node).await
    }

    /// Root directory staging bins live under, needed by C10 to locate
    /// a session's staged blob for scanning.
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    pub fn node_store(&self) -> &Arc<dyn NodeStore> {
        &self.node_store
    }

    pub fn sessions(&self) -> &Arc<dyn UploadSessionStore> {
        &self.sessions
    }
}

/// `hash(node_id || mtime_rfc3339nano)` (spec.md §4.9), computed with
/// sha1 for consistency with the engine's other checksums.
pub fn compute_etag(node_id: &str, mtime_rfc3339nano: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(node_id.as_bytes());
    hasher.update(mtime_rfc3339nano.as_bytes());
    hex::encode(hasher.finalize())
}

async fn write_at(path: &std::path::Path, offset: u64, bytes: &[u8]) -> AppResult<()> {
    use tokio::io::{AsyncSeekExt, AsyncWriteExt};

    let mut file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    Ok(())
}

/// Recomputes all three running checksums over the first `len` bytes of
/// the staging file. Restreaming on every chunk, rather than persisting
/// true hasher internal state, keeps each chunk's result correct across
/// a process restart without relying on the hash crates exposing a
/// serialisable core (spec.md §8 invariant 4).
async fn hash_file_prefix(path: &std::path::Path, len: u64) -> AppResult<HasherState> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path).await?;
    let mut remaining = len;
    let mut sha1 = Sha1::new();
    let mut md5 = Md5::new();
    let mut adler = RollingAdler32::new();
    let mut buf = vec![0u8; 64 * 1024];

    while remaining > 0 {
        let to_read = remaining.min(buf.len() as u64) as usize;
        let read = file.read(&mut buf[..to_read]).await?;
        if read == 0 {
            break;
        }
        sha1.update(&buf[..read]);
        md5.update(&buf[..read]);
        adler.update_buffer(&buf[..read]);
        remaining -= read as u64;
    }

    Ok(HasherState {
        sha1: sha1.finalize().to_vec(),
        md5: md5.finalize().to_vec(),
        adler32: adler.hash(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::LocalBlobStore;
    use crate::events::MemoryEventSink;
    use crate::metadata::msgpack::MsgPackBackend;
    use crate::node::LocalNodeStore;
    use crate::upload::LocalUploadSessionStore;
    use tempfile::tempdir;

    fn make_engine(root: PathBuf) -> (UploadEngine, Arc<dyn NodeStore>, Arc<dyn MetadataBackend>) {
        let backend: Arc<dyn MetadataBackend> = Arc::new(MsgPackBackend::new());
        let locks = LockManager::new(10, 1);
        let node_store: Arc<dyn NodeStore> = Arc::new(LocalNodeStore::new(root.clone(), backend.clone(), locks.clone()));
        let blob_store: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new());
        let sessions: Arc<dyn UploadSessionStore> = Arc::new(LocalUploadSessionStore::new(root.clone()));
        let events: Arc<dyn EventSink> = Arc::new(MemoryEventSink::new());
        let engine = UploadEngine::new(
            root,
            node_store.clone(),
            backend.clone(),
            blob_store,
            locks,
            sessions,
            DEFAULT_MAX_FILE_SIZE,
            events,
        );
        (engine, node_store, backend)
    }

    fn executant() -> Executant {
        Executant {
            idp: "idp".into(),
            id: "user-1".into(),
            user_type: "primary".into(),
            username: "alice".into(),
        }
    }

    async fn make_space_root(node_store: &Arc<dyn NodeStore>, backend: &Arc<dyn MetadataBackend>, root: &std::path::Path, space_id: &str) {
        let root_path = node_path::node_path(root, space_id, space_id);
        tokio::fs::create_dir_all(&root_path).await.unwrap();
        let locks = LockManager::new(5, 1);
        let guard = locks.acquire(&node_path::lock_path_for(&root_path)).await.unwrap();
        backend
            .set_multiple(
                &root_path,
                &[
                    (ATTR_PARENT_ID, ROOT_PARENT_ID.as_bytes()),
                    (ATTR_NAME, b"".as_slice()),
                    (ATTR_TYPE, b"container".as_slice()),
                ],
                &guard,
            )
            .await
            .unwrap();
        let _ = node_store.from_id(space_id, space_id).await.unwrap();
    }

    #[tokio::test]
    async fn upload_round_trip_matches_scenario_s1() {
        let dir = tempdir().unwrap();
        let (engine, node_store, _backend) = make_engine(dir.path().to_path_buf());
        let space_id = "11111111-1111-1111-1111-111111111111";
        make_space_root(&node_store, &_backend, dir.path(), space_id).await;

        let session = engine
            .open(OpenRequest {
                space_id: space_id.to_string(),
                dir: "/".to_string(),
                filename: "hello.txt".to_string(),
                size: Some(5),
                lock_id: None,
                preconditions: Preconditions::default(),
                executant: executant(),
                mtime: None,
                expires: None,
            })
            .await
            .unwrap();

        let session = engine.write_chunk(&session.upload_id, 0, b"hello").await.unwrap();
        assert_eq!(session.offset, 5);

        let outcome = engine
            .finish(&session.upload_id, Some("sha1 aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"))
            .await
            .unwrap();

        assert_eq!(outcome.size_diff, 5);
        assert_eq!(outcome.node.name, "hello.txt");
    }

    #[tokio::test]
    async fn checksum_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        let (engine, node_store, backend) = make_engine(dir.path().to_path_buf());
        let space_id = "22222222-2222-2222-2222-222222222222";
        make_space_root(&node_store, &backend, dir.path(), space_id).await;

        let session = engine
            .open(OpenRequest {
                space_id: space_id.to_string(),
                dir: "/".to_string(),
                filename: "x.bin".to_string(),
                size: Some(3),
                lock_id: None,
                preconditions: Preconditions::default(),
                executant: executant(),
                mtime: None,
                expires: None,
            })
            .await
            .unwrap();

        let session = engine.write_chunk(&session.upload_id, 0, b"abc").await.unwrap();
        let err = engine
            .finish(&session.upload_id, Some("sha1 0000000000000000000000000000000000000000"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn write_chunk_out_of_order_is_rejected() {
        let dir = tempdir().unwrap();
        let (engine, node_store, backend) = make_engine(dir.path().to_path_buf());
        let space_id = "33333333-3333-3333-3333-333333333333";
        make_space_root(&node_store, &backend, dir.path(), space_id).await;

        let session = engine
            .open(OpenRequest {
                space_id: space_id.to_string(),
                dir: "/".to_string(),
                filename: "x.bin".to_string(),
                size: Some(10),
                lock_id: None,
                preconditions: Preconditions::default(),
                executant: executant(),
                mtime: None,
                expires: None,
            })
            .await
            .unwrap();

        let err = engine.write_chunk(&session.upload_id, 5, b"abc").await.unwrap_err();
        assert!(matches!(err, AppError::PreconditionFailed { .. }));
    }
}
