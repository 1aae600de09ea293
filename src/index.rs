//! # Space Index (C7)
//!
//! Two symlink-based indexes under `<root>/indexes/` (spec.md §4.7):
//! `by-user-id/<user-id>/<space-id>` and `by-type/<space-type>/<space-id>`,
//! both pointing at the space's root node directory. Building these as
//! plain symlinks — rather than a database — means listing a user's
//! spaces is a directory glob, and a broken link (space deleted without
//! index cleanup) just gets skipped with a log line.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::errors::AppResult;
use crate::node::path as node_path;

/// `<root>/indexes/by-user-id/<user-id>/<space-id>`.
pub fn by_user_link(root: &Path, user_id: &str, space_id: &str) -> PathBuf {
    root.join("indexes/by-user-id").join(user_id).join(space_id)
}

/// `<root>/indexes/by-type/<space-type>/<space-id>`.
pub fn by_type_link(root: &Path, space_type: &str, space_id: &str) -> PathBuf {
    root.join("indexes/by-type").join(space_type).join(space_id)
}

/// Adds both index entries for a space. `MkdirAll` + `Symlink`,
/// tolerating `AlreadyExists` as a no-op (spec.md §5).
pub async fn add_entries(
    root: &Path,
    space_id: &str,
    user_id: &str,
    space_type: &str,
) -> AppResult<()> {
    let target = node_path::node_path(root, space_id, space_id);
    symlink_idempotent(&by_user_link(root, user_id, space_id), &target).await?;
    symlink_idempotent(&by_type_link(root, space_type, space_id), &target).await?;
    Ok(())
}

async fn symlink_idempotent(link: &Path, target: &Path) -> AppResult<()> {
    if let Some(parent) = link.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::symlink(target, link).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// A single index entry resolved off disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub space_id: String,
    pub node_id: String,
}

/// Parses `ReadSpaceAndNodeFromIndexLink`: an index symlink's target is a
/// node path ending in the sharded space-root id; both the space id
/// (directory name component of the link) and node id (unsharded link
/// target) are extracted.
fn read_space_and_node_from_index_link(link: &Path) -> Option<IndexEntry> {
    let space_id = link.file_name()?.to_string_lossy().to_string();
    let target = std::fs::read_link(link).ok()?;
    let node_id = node_path::node_id_from_link_target(&target).unwrap_or_else(|| space_id.clone());
    Some(IndexEntry { space_id, node_id })
}

/// Globs every space-id entry under `dir` (a `by-user-id/<user>` or
/// `by-type/<type>` directory), discarding broken links with a warning.
pub fn list_dir(dir: &Path) -> Vec<IndexEntry> {
    let pattern = dir.join("*");
    let Some(pattern) = pattern.to_str() else {
        return Vec::new();
    };

    let mut out = Vec::new();
    let Ok(paths) = glob::glob(pattern) else {
        return out;
    };

    for entry in paths.flatten() {
        match read_space_and_node_from_index_link(&entry) {
            Some(parsed) => out.push(parsed),
            None => warn!(path = %entry.display(), "discarding broken space index link"),
        }
    }
    out
}

/// Filters applied by [`list_storage_spaces`].
#[derive(Default, Debug, Clone)]
pub struct ListFilter {
    pub space_id: Option<String>,
    pub space_type: Option<String>,
    pub user_id: Option<String>,
    pub unrestricted: bool,
}

/// Checks whether `user_id` is allowed to see `space_id` when a listing
/// is not `unrestricted`. The node store/permission layer proper lives
/// outside this crate's scope (spec.md §1); callers inject their own
/// check here.
pub type PermissionCheck<'a> = dyn Fn(&str, &str) -> bool + Send + Sync + 'a;

/// Lists spaces visible under `filter`. An `unrestricted` listing
/// requires the caller to have already proven the `list-all-spaces`
/// role (checked by the caller, not here); otherwise every candidate
/// space is checked individually via `permission_check(user, space)`.
pub fn list_storage_spaces(
    root: &Path,
    filter: &ListFilter,
    requesting_user: &str,
    has_list_all_spaces_role: bool,
    permission_check: &PermissionCheck<'_>,
) -> AppResult<Vec<IndexEntry>> {
    let candidates = if let Some(space_type) = &filter.space_type {
        list_dir(&root.join("indexes/by-type").join(space_type))
    } else if let Some(user_id) = &filter.user_id {
        list_dir(&root.join("indexes/by-user-id").join(user_id))
    } else {
        list_all_spaces(root)
    };

    let mut out: Vec<IndexEntry> = candidates
        .into_iter()
        .filter(|e| match &filter.space_id {
            Some(id) => *id == e.space_id,
            None => true,
        })
        .collect();

    if filter.unrestricted {
        if !has_list_all_spaces_role {
            return Err(crate::errors::AppError::PermissionDenied {
                message: "unrestricted listing requires the list-all-spaces role".to_string(),
            });
        }
    } else {
        out.retain(|e| permission_check(requesting_user, &e.space_id));
    }

    Ok(out)
}

fn list_all_spaces(root: &Path) -> Vec<IndexEntry> {
    let by_type_root = root.join("indexes/by-type");
    let Ok(read) = std::fs::read_dir(&by_type_root) else {
        return Vec::new();
    };

    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for entry in read.flatten() {
        for e in list_dir(&entry.path()) {
            if seen.insert(e.space_id.clone()) {
                out.push(e);
            }
        }
    }
    out
}
