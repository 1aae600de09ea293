//! # Propagator (C6)
//!
//! After a mutation to a node, walks its ancestor chain updating
//! `tmtime` (max-merge) and `treesize` (atomic signed adjustment) until
//! the propagation boundary — the nearest ancestor with no `propagation`
//! attribute set (spec.md §4.6).

use std::sync::Arc;

use chrono::Utc;

use crate::constants::ATTR_PROPAGATION;
use crate::constants::ATTR_TREESIZE;
use crate::errors::{AppError, AppResult};
use crate::metadata::MetadataBackend;
use crate::node::{path as node_path, Node, NodeStore};

/// Walks ancestors from `node`'s parent upward, stopping at the first
/// ancestor without the `propagation` flag. `size_diff` is added to
/// `treesize` at every ancestor visited; pass its negation to revert a
/// previously propagated change (spec.md §4.6, post-processing revert).
pub async fn propagate(
    node_store: &dyn NodeStore,
    backend: &Arc<dyn MetadataBackend>,
    locks: &crate::locks::LockManager,
    node: &Node,
    size_diff: i64,
) -> AppResult<()> {
    if node.is_space_root() {
        return Ok(());
    }

    let now = Utc::now();
    let mut current = node_store.from_id(&node.space_id, &node.parent_id).await?;

    loop {
        let has_flag = match backend.get(&current.path, ATTR_PROPAGATION).await {
            Ok(_) => true,
            Err(AppError::NoAttribute { .. }) => false,
            Err(e) => return Err(e),
        };
        if !has_flag {
            break;
        }

        let lock_path = node_path::lock_path_for(&current.path);
        let guard = locks.acquire(&lock_path).await?;

        crate::time::bump_tmtime(backend.as_ref(), &current.path, now, &guard).await?;
        adjust_treesize(backend.as_ref(), &current.path, size_diff, &guard).await?;

        guard.release();

        if current.is_space_root() {
            break;
        }
        current = node_store.from_id(&current.space_id, &current.parent_id).await?;
    }

    Ok(())
}

/// Atomically adds `size_diff` to the `treesize` attribute, treating a
/// missing attribute as zero. Stored as a decimal string, like every
/// other "notable key" (spec.md §6), not raw binary.
async fn adjust_treesize(
    backend: &dyn MetadataBackend,
    node_path: &std::path::Path,
    size_diff: i64,
    lock: &crate::locks::LockGuard,
) -> AppResult<()> {
    let current = match backend.get_int64(node_path, ATTR_TREESIZE).await {
        Ok(v) => v,
        Err(AppError::NoAttribute { .. }) => 0,
        Err(e) => return Err(e),
    };
    let updated = current + size_diff;
    backend
        .set(node_path, ATTR_TREESIZE, updated.to_string().as_bytes(), lock)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::LockManager;
    use crate::metadata::msgpack::MsgPackBackend;
    use crate::node::{LocalNodeStore, ResourceType};
    use tempfile::tempdir;

    #[tokio::test]
    async fn propagation_stops_at_boundary_and_bumps_treesize() {
        let dir = tempdir().unwrap();
        let root_dir = dir.path().to_path_buf();
        let backend: Arc<dyn MetadataBackend> = Arc::new(MsgPackBackend::new());
        let locks = LockManager::new(10, 1);
        let store = LocalNodeStore::new(root_dir.clone(), backend.clone(), locks.clone());

        let space_id = "55555555-5555-5555-5555-555555555555";
        let space_root_path = crate::node::path::node_path(&root_dir, space_id, space_id);
        tokio::fs::create_dir_all(&space_root_path).await.unwrap();
        let setup_guard = locks
            .acquire(&crate::node::path::lock_path_for(&space_root_path))
            .await
            .unwrap();
        backend
            .set_multiple(
                &space_root_path,
                &[
                    (crate::constants::ATTR_PARENT_ID, crate::constants::ROOT_PARENT_ID.as_bytes()),
                    (crate::constants::ATTR_NAME, b"".as_slice()),
                    (crate::constants::ATTR_TYPE, b"container".as_slice()),
                    (ATTR_PROPAGATION, b"1"),
                ],
                &setup_guard,
            )
            .await
            .unwrap();
        setup_guard.release();
        let root = store.from_id(space_id, space_id).await.unwrap();

        let file = store.create(&root, "a.txt", ResourceType::File).await.unwrap();

        propagate(&store, &backend, &locks, &file, 5).await.unwrap();

        let treesize = backend
            .get_int64(&root.path, ATTR_TREESIZE)
            .await
            .unwrap();
        assert_eq!(treesize, 5);

        propagate(&store, &backend, &locks, &file, -5).await.unwrap();
        let treesize = backend
            .get_int64(&root.path, ATTR_TREESIZE)
            .await
            .unwrap();
        assert_eq!(treesize, 0);
    }
}
