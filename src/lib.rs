//! # Storage Engine
//!
//! A POSIX-backed multi-tenant file storage engine: content-addressable
//! node directories sharded for fan-out, pluggable attribute backends,
//! tree modification-time and size propagation, resumable chunked
//! uploads, and a dependency-scheduled post-processing pipeline.
//!
//! ## Architecture
//!
//! The engine is organized around the components spec.md names (C1–C10):
//! - **Locks** (`locks`) — advisory file locking combining OS `flock` with
//!   a process-local coordination map.
//! - **Metadata** (`metadata`) — pluggable attribute storage: native
//!   xattr, INI side-car, or MessagePack side-car.
//! - **Blob** (`blob`) — node content bytes, stored independently of
//!   attributes.
//! - **Node** (`node`) — the sharded node store and path resolution.
//! - **Time** (`time`) — mtime/tmtime/ctime/dtime helpers.
//! - **Propagator** (`propagator`) — tree tmtime/treesize propagation.
//! - **Space** (`space`) — tenant-scoped tree root typing.
//! - **Index** (`index`) — symlink-based space listing.
//! - **Upload** (`upload`) — resumable chunked upload sessions and the
//!   upload engine.
//! - **Events** (`events`) — payloads emitted at component boundaries.
//!
//! [`StorageEngine`] wires these into a single facade over one root
//! directory.
//!
//! ## Core Features
//!
//! - Multi-tenant spaces with per-space metadata backend and quota
//! - Resumable chunked uploads with streaming sha1/md5/adler32 checksums
//! - Tree modification-time and size propagation to a configurable
//!   boundary
//! - A small dependency-scheduled post-processing pipeline (antivirus
//!   scan, assembly) run after every upload

pub mod blob;
pub mod config;
pub mod constants;
pub mod errors;
pub mod events;
pub mod ids;
pub mod index;
pub mod locks;
pub mod logging;
pub mod metadata;
pub mod node;
pub mod propagator;
pub mod space;
pub mod time;
pub mod upload;

use std::sync::Arc;

use config::Config;
use errors::AppResult;
use events::{EventSink, LoggingEventSink};
use locks::LockManager;
use metadata::MetadataBackend;
use node::{LocalNodeStore, Node, NodeStore};
use upload::engine::UploadEngine;
use upload::{LocalUploadSessionStore, UploadSessionStore};

/// Facade wiring every component to one storage root. Construct one per
/// process (or per test); all collaborators are `Arc`-shared so cloning
/// the pieces out (e.g. for a request-scoped task) is cheap.
pub struct StorageEngine {
    config: Config,
    node_store: Arc<dyn NodeStore>,
    backend: Arc<dyn MetadataBackend>,
    blob_store: Arc<dyn blob::BlobStore>,
    locks: LockManager,
    sessions: Arc<dyn UploadSessionStore>,
    upload_engine: UploadEngine,
    events: Arc<dyn EventSink>,
}

impl StorageEngine {
    /// Builds every collaborator from `config`: the metadata backend
    /// `config.metadata_backend` names, a [`LocalNodeStore`] and
    /// [`blob::LocalBlobStore`] rooted at `config.root_dir`, and a
    /// [`LockManager`] using `config`'s retry budget. Events are logged
    /// via `tracing` by default; use [`Self::with_event_sink`] to wire a
    /// real transport.
    pub fn new(config: Config) -> Self {
        Self::with_event_sink(config, Arc::new(LoggingEventSink))
    }

    /// Same as [`Self::new`], but emitting through `events` instead of
    /// the default `tracing`-backed sink.
    pub fn with_event_sink(config: Config, events: Arc<dyn EventSink>) -> Self {
        let backend = config.metadata_backend.build();
        let locks = LockManager::new(config.lock_retry_attempts, config.lock_retry_initial_delay_ms);
        let node_store: Arc<dyn NodeStore> = Arc::new(LocalNodeStore::new(
            config.root_dir.clone(),
            backend.clone(),
            locks.clone(),
        ));
        let blob_store: Arc<dyn blob::BlobStore> = Arc::new(blob::LocalBlobStore::new());
        let sessions: Arc<dyn UploadSessionStore> = Arc::new(LocalUploadSessionStore::new(config.root_dir.clone()));

        let upload_engine = UploadEngine::new(
            config.root_dir.clone(),
            node_store.clone(),
            backend.clone(),
            blob_store.clone(),
            locks.clone(),
            sessions.clone(),
            config.max_file_size,
            events.clone(),
        );

        Self {
            config,
            node_store,
            backend,
            blob_store,
            locks,
            sessions,
            upload_engine,
            events,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn node_store(&self) -> &Arc<dyn NodeStore> {
        &self.node_store
    }

    pub fn backend(&self) -> &Arc<dyn MetadataBackend> {
        &self.backend
    }

    pub fn blob_store(&self) -> &Arc<dyn blob::BlobStore> {
        &self.blob_store
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn sessions(&self) -> &Arc<dyn UploadSessionStore> {
        &self.sessions
    }

    pub fn upload_engine(&self) -> &UploadEngine {
        &self.upload_engine
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Runs C10's post-processing pipeline for a just-finished upload,
    /// then propagates the resulting size delta up the tree.
    pub async fn run_postprocessing(
        &self,
        session: &upload::Session,
        outcome: upload::engine::FinishOutcome,
        pipeline: upload::postprocessing::Pipeline,
    ) -> AppResult<events::PostprocessingOutcome> {
        let size_diff = outcome.size_diff;
        let node = outcome.node.clone();
        let result = pipeline
            .run(&self.upload_engine, session, outcome, self.events.as_ref())
            .await?;

        if result == events::PostprocessingOutcome::Continue {
            propagator::propagate(self.node_store.as_ref(), &self.backend, &self.locks, &node, size_diff).await?;
        }

        self.events
            .emit(events::Event::UploadReady(events::UploadReady {
                upload_id: session.upload_id.clone(),
                space_id: session.space_id.clone(),
                node_id: session.node_id.clone().or(Some(node.id.clone())),
                failed: result != events::PostprocessingOutcome::Continue,
                executant: session.executant.clone(),
                space_owner_id: session.space_owner_id.clone(),
            }))
            .await;

        Ok(result)
    }

    /// Looks up a space's root node and its typed [`space::Space`] view.
    pub async fn open_space(&self, space_id: &str) -> AppResult<(Node, space::Space)> {
        let root = self.node_store.from_id(space_id, space_id).await?;
        let space = space::Space::from_root_node(self.backend.as_ref(), &root).await?;
        Ok((root, space))
    }

    /// Registers a newly created space's root node in both symlink
    /// indexes (spec.md §4.7).
    pub async fn index_space(&self, space_id: &str, user_id: &str, space_type: space::SpaceType) -> AppResult<()> {
        index::add_entries(&self.config.root_dir, space_id, user_id, space_type.as_str()).await
    }

    /// Lists spaces visible to `requesting_user` under `filter` (spec.md
    /// §4.7).
    pub fn list_spaces(
        &self,
        filter: &index::ListFilter,
        requesting_user: &str,
        has_list_all_spaces_role: bool,
        permission_check: &index::PermissionCheck<'_>,
    ) -> AppResult<Vec<index::IndexEntry>> {
        index::list_storage_spaces(
            &self.config.root_dir,
            filter,
            requesting_user,
            has_list_all_spaces_role,
            permission_check,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn open_space_reads_back_what_was_created() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.root_dir = dir.path().to_path_buf();
        let engine = StorageEngine::new(config);

        let space_id = "77777777-7777-7777-7777-777777777777";
        let root_path = node::path::node_path(&engine.config().root_dir, space_id, space_id);
        tokio::fs::create_dir_all(&root_path).await.unwrap();
        let guard = engine
            .locks()
            .acquire(&node::path::lock_path_for(&root_path))
            .await
            .unwrap();
        engine
            .backend()
            .set_multiple(
                &root_path,
                &[
                    (constants::ATTR_PARENT_ID, constants::ROOT_PARENT_ID.as_bytes()),
                    (constants::ATTR_NAME, b"".as_slice()),
                    (constants::ATTR_TYPE, b"container".as_slice()),
                    (constants::ATTR_SPACE_TYPE, b"personal".as_slice()),
                ],
                &guard,
            )
            .await
            .unwrap();
        guard.release();

        let (root, space) = engine.open_space(space_id).await.unwrap();
        assert!(root.is_space_root());
        assert_eq!(space.space_type, space::SpaceType::Personal);

        engine
            .index_space(space_id, "user-1", space::SpaceType::Personal)
            .await
            .unwrap();
        let found = engine
            .list_spaces(
                &index::ListFilter {
                    user_id: Some("user-1".to_string()),
                    ..Default::default()
                },
                "user-1",
                false,
                &|_, _| true,
            )
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].space_id, space_id);
    }
}
