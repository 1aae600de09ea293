//! # Blob Store (C3)
//!
//! Node content bytes live separately from node metadata so a metadata
//! backend swap never touches payload bytes. [`LocalBlobStore`] keeps
//! blobs as regular files under a path keyed by the blob's own id
//! (`node::path::blob_path`), not the node's — a node's current
//! `blobid` attribute and any revision's superseded one both resolve to
//! stable, untouched content this way (spec.md §4.3). [`ObjectBlobStore`]
//! is a stub showing where an S3-backed implementation would plug in,
//! out of scope for this engine (no object-store crate is wired up).

use std::path::Path;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::errors::AppResult;

/// Content storage for node bytes, independent of attribute storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Opens `path` for streamed reading.
    async fn open_read(&self, path: &Path) -> AppResult<Box<dyn AsyncRead + Send + Unpin>>;

    /// Opens `path` for streamed writing, truncating any existing
    /// content. Parent directories are created as needed.
    async fn open_write(&self, path: &Path) -> AppResult<Box<dyn AsyncWrite + Send + Unpin>>;

    /// Copies `from` to `to` without disturbing `from`, used when
    /// materializing a revision node on overwrite (spec.md §4.9).
    async fn copy(&self, from: &Path, to: &Path) -> AppResult<()>;

    /// Moves a staged upload's bytes into their final location.
    async fn finalize(&self, staged: &Path, dest: &Path) -> AppResult<()>;

    /// Deletes the blob at `path`. A no-op if nothing is stored there.
    async fn delete(&self, path: &Path) -> AppResult<()>;

    /// Size in bytes of the blob at `path`.
    async fn size(&self, path: &Path) -> AppResult<u64>;
}

/// Blobs as plain files on the local POSIX filesystem.
pub struct LocalBlobStore;

impl LocalBlobStore {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn open_read(&self, path: &Path) -> AppResult<Box<dyn AsyncRead + Send + Unpin>> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Box::new(file))
    }

    async fn open_write(&self, path: &Path) -> AppResult<Box<dyn AsyncWrite + Send + Unpin>> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(path).await?;
        Ok(Box::new(file))
    }

    async fn copy(&self, from: &Path, to: &Path) -> AppResult<()> {
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(from, to).await?;
        Ok(())
    }

    async fn finalize(&self, staged: &Path, dest: &Path) -> AppResult<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::rename(staged, dest).await {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc_exdev()) => {
                tokio::fs::copy(staged, dest).await?;
                tokio::fs::remove_file(staged).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, path: &Path) -> AppResult<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn size(&self, path: &Path) -> AppResult<u64> {
        Ok(tokio::fs::metadata(path).await?.len())
    }
}

/// Returns the `EXDEV` errno ("invalid cross-device link"), hit when a
/// staged upload and its destination live on different mounts and a
/// plain rename can't be used.
fn libc_exdev() -> i32 {
    18
}

/// Stub for an object-storage-backed blob store (R2/S3-shaped). Not
/// wired to a real backend: this engine's scope is local POSIX storage
/// (spec.md §1), so every method returns `Internal` rather than silently
/// behaving like [`LocalBlobStore`].
pub struct ObjectBlobStore;

#[async_trait]
impl BlobStore for ObjectBlobStore {
    async fn open_read(&self, _path: &Path) -> AppResult<Box<dyn AsyncRead + Send + Unpin>> {
        Err(unimplemented_backend())
    }

    async fn open_write(&self, _path: &Path) -> AppResult<Box<dyn AsyncWrite + Send + Unpin>> {
        Err(unimplemented_backend())
    }

    async fn copy(&self, _from: &Path, _to: &Path) -> AppResult<()> {
        Err(unimplemented_backend())
    }

    async fn finalize(&self, _staged: &Path, _dest: &Path) -> AppResult<()> {
        Err(unimplemented_backend())
    }

    async fn delete(&self, _path: &Path) -> AppResult<()> {
        Err(unimplemented_backend())
    }

    async fn size(&self, _path: &Path) -> AppResult<u64> {
        Err(unimplemented_backend())
    }
}

fn unimplemented_backend() -> crate::errors::AppError {
    crate::errors::AppError::internal("object blob store is not wired to a backend")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn write_then_read_round_trips_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a/b/blob");
        let store = LocalBlobStore::new();

        let mut writer = store.open_write(&path).await.unwrap();
        writer.write_all(b"hello world").await.unwrap();
        writer.flush().await.unwrap();

        let mut reader = store.open_read(&path).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello world");
    }

    #[tokio::test]
    async fn finalize_moves_staged_file_to_destination() {
        let dir = tempdir().unwrap();
        let staged = dir.path().join("staged");
        let dest = dir.path().join("nested/dest");
        tokio::fs::write(&staged, b"payload").await.unwrap();

        let store = LocalBlobStore::new();
        store.finalize(&staged, &dest).await.unwrap();

        assert!(!staged.exists());
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ghost");
        let store = LocalBlobStore::new();
        store.delete(&path).await.unwrap();
        store.delete(&path).await.unwrap();
    }
}
