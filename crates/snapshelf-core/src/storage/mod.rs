//! Storage layer - key/value persistence for sync state
//!
//! The sync core keeps two kinds of state between runs: the device identity
//! and in-flight import sessions. Both go through [`KeyValueStore`], so the
//! host application can back them with whatever it already uses.
//!
//! # Architecture
//!
//! - `memory`: In-process map, for tests and short-lived hosts
//! - `file`: One JSON document per key under a data directory
//!
//! # Usage
//!
//! ```ignore
//! use snapshelf_core::storage::{FileStore, KeyValueStore};
//!
//! let store = FileStore::open(FileStore::default_dir()?).await?;
//! store.set("device/identity", "{...}").await?;
//! ```

pub mod file;
pub mod memory;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

pub use file::FileStore;
pub use memory::MemoryStore;

/// String key/value persistence port
///
/// Keys are `/`-separated paths of `[A-Za-z0-9_.-]` segments.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value, returning whether it existed
    async fn remove(&self, key: &str) -> Result<bool>;

    /// List keys starting with `prefix`, sorted
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Read a JSON value from the store
pub async fn get_json<T, S>(store: &S, key: &str) -> Result<Option<T>>
where
    T: DeserializeOwned,
    S: KeyValueStore + ?Sized,
{
    match store.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| Error::StorageError(format!("Corrupted value at '{}': {}", key, e))),
        None => Ok(None),
    }
}

/// Write a JSON value to the store
pub async fn set_json<T, S>(store: &S, key: &str, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
    S: KeyValueStore + ?Sized,
{
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw).await
}

/// Check that a key is usable by every store implementation
pub fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.split('/').all(|segment| {
            !segment.is_empty()
                && segment != "."
                && segment != ".."
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        });

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("Invalid storage key '{}'", key)))
    }
}
