//! Side-car backend storing the full attribute map as one MessagePack
//! document per node (`.meta.mp`). The engine default: compact, and
//! round-trips arbitrary binary values without the base64 overhead the
//! [`super::ini`] backend needs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;

use crate::errors::{AppError, AppResult};
use crate::locks::LockGuard;
use crate::metadata::{MetaCache, MetadataBackend};

const SUFFIX: &str = ".meta.mp";

fn side_car_path(node_path: &Path) -> PathBuf {
    let mut name = node_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(SUFFIX);
    node_path.with_file_name(name)
}

fn file_mtime(path: &Path) -> SystemTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

fn read_map(side_car: &Path) -> AppResult<HashMap<String, Vec<u8>>> {
    if !side_car.exists() {
        return Ok(HashMap::new());
    }
    let bytes = std::fs::read(side_car)?;
    if bytes.is_empty() {
        return Ok(HashMap::new());
    }
    Ok(rmp_serde::from_slice(&bytes)?)
}

fn write_map(side_car: &Path, map: &HashMap<String, Vec<u8>>) -> AppResult<()> {
    if map.is_empty() {
        let _ = std::fs::remove_file(side_car);
        return Ok(());
    }
    let bytes = rmp_serde::to_vec(map)?;
    std::fs::write(side_car, bytes)?;
    Ok(())
}

/// Backend over [`rmp_serde`], one side-car file per node.
pub struct MsgPackBackend {
    cache: MetaCache,
}

impl MsgPackBackend {
    pub fn new() -> Self {
        Self {
            cache: MetaCache::new(),
        }
    }

    fn load_cached(&self, side_car: &Path) -> AppResult<HashMap<String, Vec<u8>>> {
        let mtime = file_mtime(side_car);
        if let Some(map) = self.cache.get(side_car, mtime) {
            return Ok(map);
        }
        let map = read_map(side_car)?;
        self.cache.put(side_car.to_path_buf(), mtime, map.clone());
        Ok(map)
    }
}

impl Default for MsgPackBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataBackend for MsgPackBackend {
    async fn all(&self, node_path: &Path) -> AppResult<HashMap<String, Vec<u8>>> {
        self.load_cached(&side_car_path(node_path))
    }

    async fn get(&self, node_path: &Path, key: &str) -> AppResult<Vec<u8>> {
        self.all(node_path)
            .await?
            .remove(key)
            .ok_or_else(|| AppError::NoAttribute {
                key: key.to_string(),
            })
    }

    async fn list(&self, node_path: &Path, prefix: &str) -> AppResult<Vec<String>> {
        Ok(self
            .all(node_path)
            .await?
            .into_keys()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    async fn set(&self, node_path: &Path, key: &str, value: &[u8], _lock: &LockGuard) -> AppResult<()> {
        let side_car = side_car_path(node_path);
        let mut map = self.load_cached(&side_car)?;
        map.insert(key.to_string(), value.to_vec());
        write_map(&side_car, &map)?;
        self.cache.invalidate(&side_car);
        Ok(())
    }

    async fn set_multiple(&self, node_path: &Path, values: &[(&str, &[u8])], _lock: &LockGuard) -> AppResult<()> {
        let side_car = side_car_path(node_path);
        let mut map = self.load_cached(&side_car)?;
        for (key, value) in values {
            map.insert(key.to_string(), value.to_vec());
        }
        write_map(&side_car, &map)?;
        self.cache.invalidate(&side_car);
        Ok(())
    }

    async fn remove(&self, node_path: &Path, key: &str) -> AppResult<()> {
        let side_car = side_car_path(node_path);
        let mut map = self.load_cached(&side_car)?;
        map.remove(key);
        write_map(&side_car, &map)?;
        self.cache.invalidate(&side_car);
        Ok(())
    }

    async fn purge(&self, node_path: &Path) -> AppResult<()> {
        let side_car = side_car_path(node_path);
        let _ = std::fs::remove_file(&side_car);
        self.cache.invalidate(&side_car);
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> AppResult<()> {
        let from_side_car = side_car_path(from);
        let to_side_car = side_car_path(to);
        if from_side_car.exists() {
            std::fs::rename(&from_side_car, &to_side_car)?;
        }
        self.cache.rename(&from_side_car, &to_side_car);
        Ok(())
    }

    fn metadata_path(&self, node_path: &Path) -> PathBuf {
        side_car_path(node_path)
    }

    fn is_meta_file(&self, path: &Path) -> bool {
        path.to_string_lossy().ends_with(SUFFIX)
    }
}
