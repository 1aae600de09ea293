//! Native extended-attribute backend. Thinnest of the three: every
//! attribute maps directly onto a POSIX xattr, namespaced under
//! `user.ocis.` since unprivileged processes cannot set any namespace
//! but `user.`, and `ocis.` keeps this engine's keys from colliding with
//! some other xattr consumer's.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::errors::{AppError, AppResult};
use crate::locks::LockGuard;
use crate::metadata::MetadataBackend;

const NAMESPACE: &str = "user.ocis.";

fn xattr_name(key: &str) -> String {
    format!("{NAMESPACE}{key}")
}

fn strip_namespace(name: &str) -> Option<&str> {
    name.strip_prefix(NAMESPACE)
}

/// Backend over [`xattr`], the `getxattr`/`setxattr`/`listxattr` FFI
/// wrapper also used by this corpus's FUSE filesystem implementations.
pub struct XattrBackend;

impl XattrBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for XattrBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataBackend for XattrBackend {
    async fn all(&self, node_path: &Path) -> AppResult<HashMap<String, Vec<u8>>> {
        let path = node_path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let mut out = HashMap::new();
            let names = xattr::list(&path).map_err(AppError::from)?;
            for name in names {
                let name = name.to_string_lossy().to_string();
                if let Some(key) = strip_namespace(&name) {
                    if let Some(value) = xattr::get(&path, &name).map_err(AppError::from)? {
                        out.insert(key.to_string(), value);
                    }
                }
            }
            Ok(out)
        })
        .await
        .map_err(|e| AppError::internal(e.to_string()))?
    }

    async fn get(&self, node_path: &Path, key: &str) -> AppResult<Vec<u8>> {
        let path = node_path.to_path_buf();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            xattr::get(&path, xattr_name(&key))
                .map_err(AppError::from)?
                .ok_or_else(|| AppError::NoAttribute { key })
        })
        .await
        .map_err(|e| AppError::internal(e.to_string()))?
    }

    async fn list(&self, node_path: &Path, prefix: &str) -> AppResult<Vec<String>> {
        let all = self.all(node_path).await?;
        Ok(all
            .into_keys()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    async fn set(&self, node_path: &Path, key: &str, value: &[u8], _lock: &LockGuard) -> AppResult<()> {
        let path = node_path.to_path_buf();
        let key = key.to_string();
        let value = value.to_vec();
        tokio::task::spawn_blocking(move || {
            xattr::set(&path, xattr_name(&key), &value).map_err(AppError::from)
        })
        .await
        .map_err(|e| AppError::internal(e.to_string()))?
    }

    async fn remove(&self, node_path: &Path, key: &str) -> AppResult<()> {
        let path = node_path.to_path_buf();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || match xattr::remove(&path, xattr_name(&key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::from(e)),
        })
        .await
        .map_err(|e| AppError::internal(e.to_string()))?
    }

    async fn purge(&self, node_path: &Path) -> AppResult<()> {
        let keys: Vec<String> = self.all(node_path).await?.into_keys().collect();
        for key in keys {
            self.remove(node_path, &key).await?;
        }
        Ok(())
    }

    async fn rename(&self, _from: &Path, _to: &Path) -> AppResult<()> {
        // Attributes travel with the inode across a rename; nothing to do.
        Ok(())
    }

    fn metadata_path(&self, node_path: &Path) -> PathBuf {
        node_path.to_path_buf()
    }

    fn is_meta_file(&self, _path: &Path) -> bool {
        false
    }
}
