//! Low-level disk-layout helpers for the node store: where a node's
//! directory lives, and how parent→child symlinks encode that location
//! (spec.md §4.4).

use std::path::{Path, PathBuf};

use crate::ids::{node_shard_path, space_shard_path};

/// Depth of the node shard (4 segments of width 2, plus the unsplit
/// remainder) — this is also the number of `../` hops a child-name
/// symlink needs to climb back to `nodes/`.
const NODE_SHARD_HOPS: usize = 5;

/// Root directory holding every space (`<root>/spaces`).
pub fn spaces_root(root: &Path) -> PathBuf {
    root.join("spaces")
}

/// Directory for a single space: `<root>/spaces/<ss>/<space-tail>`.
pub fn space_dir(root: &Path, space_id: &str) -> PathBuf {
    spaces_root(root).join(space_shard_path(space_id))
}

/// Directory holding every node shard within a space:
/// `<root>/spaces/<ss>/<space-tail>/nodes`.
pub fn nodes_dir(root: &Path, space_id: &str) -> PathBuf {
    space_dir(root, space_id).join("nodes")
}

/// Hidden upload-staging directory for a space: `.oc-tmp/` under the
/// space directory (spec.md §4.3, §6).
pub fn tmp_dir(root: &Path, space_id: &str) -> PathBuf {
    space_dir(root, space_id).join(".oc-tmp")
}

/// On-disk path of a node's own directory/file:
/// `<root>/spaces/<ss>/<space-tail>/nodes/<aa>/<bb>/<cc>/<dd>/<node-tail>`.
pub fn node_path(root: &Path, space_id: &str, node_id: &str) -> PathBuf {
    nodes_dir(root, space_id).join(node_shard_path(node_id))
}

/// Directory holding every blob shard within a space:
/// `<root>/spaces/<ss>/<space-tail>/blobs`.
pub fn blobs_dir(root: &Path, space_id: &str) -> PathBuf {
    space_dir(root, space_id).join("blobs")
}

/// On-disk path of a blob, keyed by its own id rather than the node's
/// (spec.md §4.3): `.../blobs/<aa>/<bb>/<cc>/<dd>/<blob-tail>`. A node's
/// current content and any revision's superseded content each get a
/// stable location this way, since overwriting a node never reuses a
/// previous upload's blob id.
pub fn blob_path(root: &Path, space_id: &str, blob_id: &str) -> PathBuf {
    blobs_dir(root, space_id).join(node_shard_path(blob_id))
}

/// Builds the relative symlink target a container's child-name entry
/// points at: `../../../../../<shard of child id>`, climbing out of the
/// container's own shard back to `nodes/` before descending into the
/// child's.
pub fn child_link_target(child_node_id: &str) -> PathBuf {
    let mut target = PathBuf::new();
    for _ in 0..NODE_SHARD_HOPS {
        target.push("..");
    }
    target.push(node_shard_path(child_node_id));
    target
}

/// Recovers a node id from a previously-built [`child_link_target`] by
/// dropping the `../` hops and concatenating the remaining path
/// components — the inverse of [`crate::ids::pathify`].
pub fn node_id_from_link_target(target: &Path) -> Option<String> {
    let mut id = String::new();
    for component in target.components() {
        match component {
            std::path::Component::ParentDir => {}
            std::path::Component::Normal(part) => {
                id.push_str(&part.to_string_lossy());
            }
            _ => return None,
        }
    }
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

/// Path of the child-name symlink within a container's own directory.
pub fn child_link_path(container_dir: &Path, child_name: &str) -> PathBuf {
    container_dir.join(child_name)
}

/// Advisory lock side-car path for a node (spec.md §4.1: `<target>.flock`).
pub fn lock_path_for(node_path: &Path) -> PathBuf {
    let mut os_string = node_path.as_os_str().to_owned();
    os_string.push(".flock");
    PathBuf::from(os_string)
}
