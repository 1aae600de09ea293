//! # Space
//!
//! A tenant-scoped tree root (spec.md §3). `Space` is a thin, typed view
//! over a space-root [`Node`](crate::node::Node)'s attributes; the node
//! store remains the source of truth, this module just knows which
//! attribute keys compose a space.

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::errors::{AppError, AppResult};
use crate::metadata::MetadataBackend;
use crate::node::Node;

/// Space category, stored under [`ATTR_SPACE_TYPE`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpaceType {
    Personal,
    Project,
    Share,
}

impl SpaceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Personal => "personal",
            Self::Project => "project",
            Self::Share => "share",
        }
    }

    pub fn parse(s: &str) -> AppResult<Self> {
        match s {
            "personal" => Ok(Self::Personal),
            "project" => Ok(Self::Project),
            "share" => Ok(Self::Share),
            other => Err(AppError::internal(format!("unknown space type {other:?}"))),
        }
    }
}

/// A tenant-scoped tree root, read from a space-root node's attributes.
///
/// Invariant: for a [`SpaceType::Personal`] space, `id` equals the space
/// root node's own id (spec.md §3).
#[derive(Clone, Debug)]
pub struct Space {
    pub id: String,
    pub space_type: SpaceType,
    pub name: String,
    pub description: Option<String>,
    pub readme: Option<String>,
    pub image: Option<String>,
    pub alias: Option<String>,
    pub quota: Option<u64>,
    pub owner_id: Option<String>,
    pub disabled_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Space {
    /// Loads a `Space` view from a previously-resolved space-root node.
    pub async fn from_root_node(backend: &dyn MetadataBackend, root: &Node) -> AppResult<Self> {
        if !root.is_space_root() {
            return Err(AppError::Validation {
                message: format!("node {} is not a space root", root.id),
            });
        }

        let attrs = backend.all(&root.path).await?;
        let get_string = |key: &str| {
            attrs
                .get(key)
                .map(|v| String::from_utf8_lossy(v).to_string())
        };

        let space_type = get_string(ATTR_SPACE_TYPE)
            .map(|s| SpaceType::parse(&s))
            .transpose()?
            .unwrap_or(SpaceType::Personal);

        let quota = attrs
            .get(ATTR_QUOTA)
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| s.parse().ok());

        let disabled_at = match backend.get(&root.path, ATTR_DTIME).await {
            Ok(raw) => {
                let text = String::from_utf8(raw).map_err(|e| AppError::internal(e.to_string()))?;
                Some(crate::time::parse_timestamp(&text)?)
            }
            Err(AppError::NoAttribute { .. }) => None,
            Err(e) => return Err(e),
        };

        let owner_id = attrs
            .get(ATTR_OWNER_ID)
            .map(|v| String::from_utf8_lossy(v).to_string());

        Ok(Self {
            id: root.id.clone(),
            space_type,
            name: get_string(ATTR_SPACE_NAME).unwrap_or_default(),
            description: get_string(ATTR_SPACE_DESCRIPTION),
            readme: get_string(ATTR_SPACE_README),
            image: get_string(ATTR_SPACE_IMAGE),
            alias: get_string(ATTR_SPACE_ALIAS),
            quota,
            owner_id,
            disabled_at,
        })
    }

    /// Reads a single attribute off this space's root node the way an
    /// external caller would: an unset key surfaces as `NotFound` rather
    /// than the backend-internal `NoAttribute` (spec.md §7).
    pub async fn attribute(&self, backend: &dyn MetadataBackend, root: &Node, key: &str) -> AppResult<Vec<u8>> {
        backend.get(&root.path, key).await.map_err(AppError::attribute_not_found)
    }

    /// A disabled space (`dtime` set) is invisible to non-privileged
    /// readers (spec.md §3).
    pub fn is_disabled(&self) -> bool {
        self.disabled_at.is_some()
    }

    /// Remaining quota in bytes given `current_tree_size`, or `None`
    /// when the space has no quota configured (unlimited).
    pub fn remaining_quota(&self, current_tree_size: u64) -> Option<u64> {
        self.quota.map(|q| q.saturating_sub(current_tree_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::LockManager;
    use crate::metadata::msgpack::MsgPackBackend;
    use crate::node::{LocalNodeStore, NodeStore};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn loads_space_attributes_from_root_node() {
        let dir = tempdir().unwrap();
        let backend: Arc<dyn MetadataBackend> = Arc::new(MsgPackBackend::new());
        let locks = LockManager::new(10, 1);
        let store = LocalNodeStore::new(dir.path().to_path_buf(), backend.clone(), locks.clone());

        let space_id = "66666666-6666-6666-6666-666666666666";
        let root_path = crate::node::path::node_path(dir.path(), space_id, space_id);
        tokio::fs::create_dir_all(&root_path).await.unwrap();
        let guard = locks
            .acquire(&crate::node::path::lock_path_for(&root_path))
            .await
            .unwrap();
        backend
            .set_multiple(
                &root_path,
                &[
                    (ATTR_PARENT_ID, ROOT_PARENT_ID.as_bytes()),
                    (ATTR_NAME, b"".as_slice()),
                    (ATTR_TYPE, b"container".as_slice()),
                    (ATTR_SPACE_TYPE, b"personal".as_slice()),
                    (ATTR_SPACE_NAME, b"Alice".as_slice()),
                    (ATTR_QUOTA, b"1000".as_slice()),
                ],
                &guard,
            )
            .await
            .unwrap();
        guard.release();

        let root = store.from_id(space_id, space_id).await.unwrap();
        let space = Space::from_root_node(backend.as_ref(), &root).await.unwrap();

        assert_eq!(space.id, space_id);
        assert_eq!(space.name, "Alice");
        assert_eq!(space.space_type, SpaceType::Personal);
        assert!(!space.is_disabled());
        assert_eq!(space.remaining_quota(400), Some(600));
    }
}
