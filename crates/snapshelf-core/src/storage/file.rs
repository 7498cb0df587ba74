//! File-backed key/value store
//!
//! Each key maps to `<root>/<key>.json`; `/` in a key becomes a directory.
//! Writes go through a temporary file and a rename so a crash mid-write
//! never leaves a truncated value behind.

use std::env;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::error::{Error, Result};

use super::{KeyValueStore, validate_key};

const VALUE_EXTENSION: &str = "json";

/// Key/value store persisted as files under a directory
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(|e| {
            Error::StorageError(format!("Failed to create {}: {}", root.display(), e))
        })?;
        debug!(root = %root.display(), "Opened file store");
        Ok(Self { root })
    }

    /// Default data directory: `$SNAPSHELF_DATA_DIR`, else the platform data dir
    pub fn default_dir() -> Result<PathBuf> {
        if let Ok(custom_dir) = env::var("SNAPSHELF_DATA_DIR") {
            return Ok(PathBuf::from(custom_dir));
        }
        dirs::data_dir()
            .map(|dir| dir.join("snapshelf"))
            .ok_or_else(|| Error::StorageError("Could not determine data directory".to_string()))
    }

    /// Directory this store writes to
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(format!("{}.{}", key, VALUE_EXTENSION)))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        if relative.extension()?.to_str()? != VALUE_EXTENSION {
            return None;
        }
        let stem = relative.with_extension("");
        let segments: Vec<&str> = stem
            .components()
            .map(|component| component.as_os_str().to_str())
            .collect::<Option<_>>()?;
        let key = segments.join("/");
        validate_key(&key).ok().map(|_| key)
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::StorageError(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::StorageError(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value).await.map_err(|e| {
            Error::StorageError(format!("Failed to write {}: {}", tmp.display(), e))
        })?;
        fs::rename(&tmp, &path).await.map_err(|e| {
            Error::StorageError(format!("Failed to replace {}: {}", path.display(), e))
        })?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::StorageError(format!(
                "Failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::StorageError(format!(
                        "Failed to list {}: {}",
                        dir.display(),
                        e
                    )));
                }
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Some(key) = self.key_for(&path) {
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}
