//! Side-car backend storing attributes in a human-readable `.meta.ini`
//! file next to each node. Only `cs.*`/`md.*`/`grant.*` values are
//! base64-encoded (spec.md §4.2); everything else is written as plain
//! text so the file stays human-readable for the keys that matter most.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use base64::Engine;
use ini::Ini;

use crate::constants::{PREFIX_CS, PREFIX_GRANT, PREFIX_MD};
use crate::errors::{AppError, AppResult};
use crate::locks::LockGuard;
use crate::metadata::{MetaCache, MetadataBackend};

const SECTION: Option<&str> = Some("attributes");
const SUFFIX: &str = ".meta.ini";

fn is_base64_key(key: &str) -> bool {
    key.starts_with(PREFIX_CS) || key.starts_with(PREFIX_MD) || key.starts_with(PREFIX_GRANT)
}

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
    let ini = Ini::load_from_file(side_car)
        .map_err(|e| AppError::internal(format!("ini parse failed: {e}")))?;
    let mut out = HashMap::new();
    if let Some(section) = ini.section(SECTION) {
        for (key, value) in section.iter() {
            let decoded = if is_base64_key(key) {
                base64::engine::general_purpose::STANDARD
                    .decode(value)
                    .map_err(|e| AppError::internal(format!("ini value not base64: {e}")))?
            } else {
                value.as_bytes().to_vec()
            };
            out.insert(key.to_string(), decoded);
        }
    }
    Ok(out)
}

fn write_map(side_car: &Path, map: &HashMap<String, Vec<u8>>) -> AppResult<()> {
    if map.is_empty() {
        let _ = std::fs::remove_file(side_car);
        return Ok(());
    }
    let mut ini = Ini::new();
    {
        let mut section = ini.with_section(SECTION);
        for (key, value) in map {
            if is_base64_key(key) {
                let encoded = base64::engine::general_purpose::STANDARD.encode(value);
                section.set(key.as_str(), encoded);
            } else {
                let text = String::from_utf8_lossy(value).to_string();
                section.set(key.as_str(), text);
            }
        }
    }
    ini.write_to_file(side_car)
        .map_err(|e| AppError::internal(format!("ini write failed: {e}")))
}

/// Backend over the [`ini`] crate, one side-car file per node.
pub struct IniBackend {
    cache: MetaCache,
}

impl IniBackend {
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

impl Default for IniBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataBackend for IniBackend {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::LockManager;
    use tempfile::tempdir;

    #[tokio::test]
    async fn round_trips_attribute_through_side_car() {
        let dir = tempdir().unwrap();
        let node_path = dir.path().join("node");
        std::fs::write(&node_path, b"body").unwrap();
        let locks = LockManager::new(5, 1);
        let guard = locks.acquire(&node_path.with_extension("flock")).await.unwrap();

        let backend = IniBackend::new();
        backend
            .set(&node_path, "cs.sha1", b"\x01\x02binary", &guard)
            .await
            .unwrap();

        let value = backend.get(&node_path, "cs.sha1").await.unwrap();
        assert_eq!(value, b"\x01\x02binary");
        assert!(side_car_path(&node_path).exists());
    }

    #[tokio::test]
    async fn plain_text_key_is_stored_unencoded() {
        let dir = tempdir().unwrap();
        let node_path = dir.path().join("node");
        std::fs::write(&node_path, b"body").unwrap();
        let locks = LockManager::new(5, 1);
        let guard = locks.acquire(&node_path.with_extension("flock")).await.unwrap();

        let backend = IniBackend::new();
        backend.set(&node_path, "treesize", b"42", &guard).await.unwrap();

        let raw = std::fs::read_to_string(side_car_path(&node_path)).unwrap();
        assert!(raw.contains("treesize=42"), "expected plain-text value, got: {raw}");
    }

    #[tokio::test]
    async fn missing_attribute_is_no_attribute() {
        let dir = tempdir().unwrap();
        let node_path = dir.path().join("node");
        std::fs::write(&node_path, b"body").unwrap();

        let backend = IniBackend::new();
        let err = backend.get(&node_path, "md.absent").await.unwrap_err();
        assert!(matches!(err, AppError::NoAttribute { .. }));
    }

    #[test]
    fn is_meta_file_matches_suffix() {
        let backend = IniBackend::new();
        assert!(backend.is_meta_file(Path::new("/x/node.meta.ini")));
        assert!(!backend.is_meta_file(Path::new("/x/node")));
    }
}
