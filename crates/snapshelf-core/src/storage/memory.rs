//! In-memory key/value store

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;

use super::{KeyValueStore, validate_key};

/// Key/value store held in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        validate_key(key)?;
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        validate_key(key)?;
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_crud() {
        let store = MemoryStore::new();
        assert_eq!(store.get("a/b").await.unwrap(), None);

        store.set("a/b", "1").await.unwrap();
        store.set("a/c", "2").await.unwrap();
        store.set("z", "3").await.unwrap();
        assert_eq!(store.get("a/b").await.unwrap(), Some("1".to_string()));

        store.set("a/b", "4").await.unwrap();
        assert_eq!(store.get("a/b").await.unwrap(), Some("4".to_string()));

        assert_eq!(
            store.keys_with_prefix("a/").await.unwrap(),
            vec!["a/b".to_string(), "a/c".to_string()]
        );

        assert!(store.remove("a/b").await.unwrap());
        assert!(!store.remove("a/b").await.unwrap());
        assert_eq!(store.keys_with_prefix("a/").await.unwrap(), vec!["a/c".to_string()]);
    }

    #[tokio::test]
    async fn test_memory_store_rejects_bad_keys() {
        let store = MemoryStore::new();
        assert!(store.set("../x", "1").await.is_err());
    }
}
