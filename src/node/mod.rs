//! # Node Store & Path Resolution (C4)
//!
//! Maps logical paths within a space onto the flat, sharded node
//! directories described in spec.md §4.4, navigated through child-name
//! symlinks. This is the identity and parentage source of truth for
//! every other component.

pub mod path;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::*;
use crate::errors::{AppError, AppResult};
use crate::locks::LockManager;
use crate::metadata::MetadataBackend;

/// What kind of thing a node represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    File,
    Container,
    Reference,
    Symlink,
}

impl ResourceType {
    fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Container => "container",
            Self::Reference => "reference",
            Self::Symlink => "symlink",
        }
    }

    fn parse(s: &str) -> AppResult<Self> {
        match s {
            "file" => Ok(Self::File),
            "container" => Ok(Self::Container),
            "reference" => Ok(Self::Reference),
            "symlink" => Ok(Self::Symlink),
            other => Err(AppError::internal(format!("unknown resource type {other:?}"))),
        }
    }
}

/// A resolved node: enough to address it on disk and answer the common
/// questions (parent, name, type, blob) without a further attribute
/// read. Attributes not covered here (checksums, favourites, grants,
/// arbitrary `md.*`) are read on demand through the metadata backend at
/// [`Node::path`].
#[derive(Clone, Debug)]
pub struct Node {
    pub id: String,
    pub space_id: String,
    pub parent_id: String,
    pub name: String,
    pub resource_type: ResourceType,
    pub blob_id: String,
    pub blob_size: u64,
    /// On-disk path of this node's own directory/file.
    pub path: PathBuf,
}

impl Node {
    /// True for the space root: its `parent_id` is the literal `"root"`
    /// (spec.md §3).
    pub fn is_space_root(&self) -> bool {
        self.parent_id == ROOT_PARENT_ID
    }
}

/// Callback invoked on every intermediate node while walking a path in
/// [`NodeStore::node_from_resource`].
pub type VisitFn<'a> = dyn Fn(&Node) + Send + Sync + 'a;

/// Permission predicate used by [`NodeStore::path`] to decide where to
/// stop walking back up toward the space root.
pub type PermissionFn<'a> = dyn Fn(&Node) -> bool + Send + Sync + 'a;

/// Attribute-filter predicate for [`NodeStore::copy_metadata`].
pub type AttrFilterFn<'a> = dyn Fn(&str) -> bool + Send + Sync + 'a;

#[async_trait::async_trait]
pub trait NodeStore: Send + Sync {
    /// Resolves a reference: with no `path`, returns the space root;
    /// otherwise walks `path`'s segments via [`Self::child`] starting
    /// from the space root (or from `opaque_id` if supplied instead of
    /// a space-relative walk).
    async fn node_from_resource(
        &self,
        space_id: &str,
        opaque_id: Option<&str>,
        path: Option<&str>,
        visit: Option<&VisitFn<'_>>,
    ) -> AppResult<Node>;

    /// Loads a node directly by space id + node id, bypassing any walk.
    async fn from_id(&self, space_id: &str, node_id: &str) -> AppResult<Node>;

    /// Reads the child-name symlink under `parent`, resolves it to the
    /// child node, and follows `cs3.ref` if the child is a reference.
    async fn child(&self, parent: &Node, name: &str) -> AppResult<Node>;

    /// Reconstructs the logical path from the space root down to `node`
    /// by walking parent pointers, truncating at the first ancestor for
    /// which `has_permission` returns `false`.
    async fn path(&self, node: &Node, has_permission: &PermissionFn<'_>) -> AppResult<String>;

    /// Copies `src`'s attributes onto `target` under a shared lock on
    /// `src` and an exclusive lock on `target`. Errors accumulate; the
    /// last one is returned if any occurred, but every attribute is
    /// still attempted.
    async fn copy_metadata(
        &self,
        src: &Node,
        target: &Node,
        filter: Option<&AttrFilterFn<'_>>,
    ) -> AppResult<()>;

    /// Creates a new child of `parent` named `name`. Fails with
    /// `AlreadyExists` if the child-name symlink is already present —
    /// the race two concurrent `Initiate`s settle via this check
    /// (spec.md invariant 5).
    async fn create(&self, parent: &Node, name: &str, resource_type: ResourceType) -> AppResult<Node>;

    /// Renames/moves `node` under `new_parent` with `new_name`. Replaces
    /// the child-name symlink and updates `parentid`/`name` on the
    /// node's own attributes; not atomic across the two writes (spec.md
    /// §4.4).
    async fn rename(&self, node: &Node, new_parent: &Node, new_name: &str) -> AppResult<Node>;

    /// Moves `node` to the trash store: removes the parent's child-name
    /// symlink, stamps `trash.origin` and `dtime`, and leaves the node's
    /// own directory and blob untouched.
    async fn delete(&self, node: &Node, origin_path: &str) -> AppResult<()>;

    /// Permanently removes a node's attribute record and its own
    /// directory/file. Does not touch the blob store; callers coordinate
    /// blob deletion separately.
    async fn purge(&self, node: &Node) -> AppResult<()>;
}

/// [`NodeStore`] over the local POSIX filesystem.
pub struct LocalNodeStore {
    root: PathBuf,
    backend: Arc<dyn MetadataBackend>,
    locks: LockManager,
}

impl LocalNodeStore {
    pub fn new(root: PathBuf, backend: Arc<dyn MetadataBackend>, locks: LockManager) -> Self {
        Self { root, backend, locks }
    }

    async fn load_node(&self, space_id: &str, node_id: &str) -> AppResult<Node> {
        let node_path = path::node_path(&self.root, space_id, node_id);
        if !node_path.exists() {
            return Err(AppError::not_found(format!("node {node_id} does not exist")));
        }

        let attrs = self.backend.all(&node_path).await?;
        let parent_id = attr_string(&attrs, ATTR_PARENT_ID).unwrap_or_else(|| ROOT_PARENT_ID.to_string());
        let name = attr_string(&attrs, ATTR_NAME).unwrap_or_default();
        let resource_type = attrs
            .get(ATTR_TYPE)
            .map(|v| String::from_utf8_lossy(v).to_string())
            .map(|s| ResourceType::parse(&s))
            .transpose()?
            .unwrap_or(ResourceType::File);
        let blob_id = attr_string(&attrs, ATTR_BLOB_ID).unwrap_or_default();
        let blob_size = attrs
            .get(ATTR_BLOB_SIZE)
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        Ok(Node {
            id: node_id.to_string(),
            space_id: space_id.to_string(),
            parent_id,
            name,
            resource_type,
            blob_id,
            blob_size,
            path: node_path,
        })
    }

    async fn resolve_reference(&self, node: Node) -> AppResult<Node> {
        if node.resource_type != ResourceType::Reference {
            return Ok(node);
        }
        let raw = self.backend.get(&node.path, ATTR_CS3_REF).await?;
        let encoded = String::from_utf8(raw).map_err(|e| AppError::internal(e.to_string()))?;
        let body = encoded
            .get(4..)
            .ok_or_else(|| AppError::internal("malformed cs3.ref"))?;
        let body = body.strip_prefix("cs3:").unwrap_or(body);
        let (storage_id, node_id) = body
            .split_once('/')
            .ok_or_else(|| AppError::internal("malformed cs3.ref"))?;
        self.from_id(storage_id, node_id).await
    }
}

fn attr_string(attrs: &HashMap<String, Vec<u8>>, key: &str) -> Option<String> {
    attrs.get(key).map(|v| String::from_utf8_lossy(v).to_string())
}

#[async_trait::async_trait]
impl NodeStore for LocalNodeStore {
    async fn node_from_resource(
        &self,
        space_id: &str,
        opaque_id: Option<&str>,
        path: Option<&str>,
        visit: Option<&VisitFn<'_>>,
    ) -> AppResult<Node> {
        let mut current = match opaque_id {
            Some(id) => self.from_id(space_id, id).await?,
            None => self.from_id(space_id, space_id).await?,
        };

        let Some(path) = path else {
            return Ok(current);
        };

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for (i, segment) in segments.iter().enumerate() {
            if let Some(visit) = visit {
                visit(&current);
            }
            match self.child(&current, segment).await {
                Ok(child) => current = child,
                Err(e) if i + 1 < segments.len() => return Err(e),
                Err(e) => return Err(e),
            }
        }
        Ok(current)
    }

    async fn from_id(&self, space_id: &str, node_id: &str) -> AppResult<Node> {
        self.load_node(space_id, node_id).await
    }

    async fn child(&self, parent: &Node, name: &str) -> AppResult<Node> {
        let link = path::child_link_path(&parent.path, name);
        let target = tokio::fs::read_link(&link)
            .await
            .map_err(|_| AppError::not_found(format!("no child named {name:?}")))?;
        let child_id = path::node_id_from_link_target(&target)
            .ok_or_else(|| AppError::internal("malformed child-name symlink"))?;
        let child = self.load_node(&parent.space_id, &child_id).await?;
        self.resolve_reference(child).await
    }

    async fn path(&self, node: &Node, has_permission: &PermissionFn<'_>) -> AppResult<String> {
        let mut segments = Vec::new();
        let mut current = node.clone();

        loop {
            if !has_permission(&current) {
                break;
            }
            if current.is_space_root() {
                break;
            }
            segments.push(current.name.clone());
            current = self.from_id(&current.space_id, &current.parent_id).await?;
        }

        segments.reverse();
        Ok(format!("/{}", segments.join("/")))
    }

    async fn copy_metadata(
        &self,
        src: &Node,
        target: &Node,
        filter: Option<&AttrFilterFn<'_>>,
    ) -> AppResult<()> {
        let src_lock = path::lock_path_for(&src.path);
        let _src_guard = self.locks.acquire_shared(&src_lock).await?;
        let target_lock = path::lock_path_for(&target.path);
        let target_guard = self.locks.acquire(&target_lock).await?;

        let attrs = self.backend.all(&src.path).await?;
        let mut last_err = None;
        for (key, value) in attrs {
            if let Some(filter) = filter {
                if !filter(&key) {
                    continue;
                }
            }
            if let Err(e) = self.backend.set(&target.path, &key, &value, &target_guard).await {
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn create(&self, parent: &Node, name: &str, resource_type: ResourceType) -> AppResult<Node> {
        let lock_path = path::lock_path_for(&parent.path);
        let _guard = self.locks.acquire(&lock_path).await?;

        let link = path::child_link_path(&parent.path, name);
        if tokio::fs::symlink_metadata(&link).await.is_ok() {
            return Err(AppError::AlreadyExists { path: link });
        }

        let node_id = Uuid::new_v4().to_string();
        let node_path = path::node_path(&self.root, &parent.space_id, &node_id);
        if let Some(dir) = node_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        match resource_type {
            ResourceType::Container => tokio::fs::create_dir_all(&node_path).await?,
            _ => {
                tokio::fs::File::create(&node_path).await?;
            }
        }

        let target = path::child_link_target(&node_id);
        match tokio::fs::symlink(&target, &link).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(AppError::AlreadyExists { path: link });
            }
            Err(e) => return Err(e.into()),
        }

        let node_guard = self.locks.acquire(&path::lock_path_for(&node_path)).await?;
        self.backend
            .set_multiple(
                &node_path,
                &[
                    (ATTR_PARENT_ID, parent.id.as_bytes()),
                    (ATTR_NAME, name.as_bytes()),
                    (ATTR_TYPE, resource_type.as_str().as_bytes()),
                ],
                &node_guard,
            )
            .await?;

        self.load_node(&parent.space_id, &node_id).await
    }

    async fn rename(&self, node: &Node, new_parent: &Node, new_name: &str) -> AppResult<Node> {
        let node_lock = path::lock_path_for(&node.path);
        let node_guard = self.locks.acquire(&node_lock).await?;

        let old_link = {
            // Find the existing child-name entry under the current parent by
            // reading the node's own recorded name/parent.
            let parent = self.from_id(&node.space_id, &node.parent_id).await?;
            path::child_link_path(&parent.path, &node.name)
        };

        let new_link = path::child_link_path(&new_parent.path, new_name);
        if tokio::fs::symlink_metadata(&new_link).await.is_ok() {
            return Err(AppError::AlreadyExists { path: new_link });
        }

        let target = path::child_link_target(&node.id);
        tokio::fs::symlink(&target, &new_link).await?;
        let _ = tokio::fs::remove_file(&old_link).await;

        self.backend
            .set_multiple(
                &node.path,
                &[
                    (ATTR_PARENT_ID, new_parent.id.as_bytes()),
                    (ATTR_NAME, new_name.as_bytes()),
                ],
                &node_guard,
            )
            .await?;

        self.load_node(&node.space_id, &node.id).await
    }

    async fn delete(&self, node: &Node, origin_path: &str) -> AppResult<()> {
        let lock_path = path::lock_path_for(&node.path);
        let guard = self.locks.acquire(&lock_path).await?;

        let parent = self.from_id(&node.space_id, &node.parent_id).await?;
        let link = path::child_link_path(&parent.path, &node.name);
        let _ = tokio::fs::remove_file(&link).await;

        let now = crate::time::format_timestamp(chrono::Utc::now());
        self.backend
            .set_multiple(
                &node.path,
                &[
                    (ATTR_TRASH_ORIGIN, origin_path.as_bytes()),
                    (ATTR_DTIME, now.as_bytes()),
                ],
                &guard,
            )
            .await?;
        Ok(())
    }

    async fn purge(&self, node: &Node) -> AppResult<()> {
        self.backend.purge(&node.path).await?;
        if node.path.is_dir() {
            tokio::fs::remove_dir_all(&node.path).await?;
        } else {
            let _ = tokio::fs::remove_file(&node.path).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::msgpack::MsgPackBackend;
    use tempfile::tempdir;

    fn make_store(root: PathBuf) -> LocalNodeStore {
        LocalNodeStore::new(root, Arc::new(MsgPackBackend::new()), LockManager::new(10, 1))
    }

    async fn make_space_root(store: &LocalNodeStore, space_id: &str) -> Node {
        let node_path = path::node_path(&store.root, space_id, space_id);
        tokio::fs::create_dir_all(&node_path).await.unwrap();
        let guard = store.locks.acquire(&path::lock_path_for(&node_path)).await.unwrap();
        store
            .backend
            .set_multiple(
                &node_path,
                &[
                    (ATTR_PARENT_ID, ROOT_PARENT_ID.as_bytes()),
                    (ATTR_NAME, b"".as_slice()),
                    (ATTR_TYPE, ResourceType::Container.as_str().as_bytes()),
                ],
                &guard,
            )
            .await
            .unwrap();
        guard.release();
        store.from_id(space_id, space_id).await.unwrap()
    }

    #[tokio::test]
    async fn create_then_child_resolves_node() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path().to_path_buf());
        let space_id = "11111111-1111-1111-1111-111111111111";
        let root = make_space_root(&store, space_id).await;

        let created = store.create(&root, "hello.txt", ResourceType::File).await.unwrap();
        let resolved = store.child(&root, "hello.txt").await.unwrap();
        assert_eq!(resolved.id, created.id);
        assert_eq!(resolved.parent_id, root.id);
    }

    #[tokio::test]
    async fn create_twice_with_same_name_fails_already_exists() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path().to_path_buf());
        let space_id = "22222222-2222-2222-2222-222222222222";
        let root = make_space_root(&store, space_id).await;

        store.create(&root, "a", ResourceType::File).await.unwrap();
        let err = store.create(&root, "a", ResourceType::File).await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn rename_updates_parent_and_name() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path().to_path_buf());
        let space_id = "33333333-3333-3333-3333-333333333333";
        let root = make_space_root(&store, space_id).await;

        let a = store.create(&root, "dir-a", ResourceType::Container).await.unwrap();
        let file = store.create(&a, "file.txt", ResourceType::File).await.unwrap();

        let renamed = store.rename(&file, &root, "moved.txt").await.unwrap();
        assert_eq!(renamed.name, "moved.txt");
        assert_eq!(renamed.parent_id, root.id);
        assert!(store.child(&root, "moved.txt").await.is_ok());
        assert!(store.child(&a, "file.txt").await.is_err());
    }

    #[tokio::test]
    async fn delete_removes_child_link_but_keeps_node_dir() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path().to_path_buf());
        let space_id = "44444444-4444-4444-4444-444444444444";
        let root = make_space_root(&store, space_id).await;

        let file = store.create(&root, "gone.txt", ResourceType::File).await.unwrap();
        store.delete(&file, "/gone.txt").await.unwrap();

        assert!(store.child(&root, "gone.txt").await.is_err());
        assert!(file.path.exists());
    }
}
