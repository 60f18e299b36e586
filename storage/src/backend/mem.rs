//! In-memory storage backend.

use crate::{Store, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

/// In-memory store; values live for the lifetime of the process.
pub struct MemoryStore {
    entries: DashMap<String, Bytes>,
}

impl MemoryStore {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.entries
            .get(key)
            .map(|value| value.to_vec())
            .ok_or(StoreError::NotFound)
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        debug!("store put key={} len={}", key, data.len());
        self.entries
            .insert(key.to_string(), Bytes::copy_from_slice(data));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_roundtrip() {
        let store = MemoryStore::new();
        store.put("/0/0/0", b"coaps://lw.example?aid=a").await.unwrap();
        assert_eq!(
            store.get("/0/0/0").await.unwrap(),
            b"coaps://lw.example?aid=a"
        );
    }

    #[tokio::test]
    async fn test_memory_missing_key() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get("/0/0/3").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_memory_overwrite() {
        let store = MemoryStore::new();
        store.put("/0/0/5", b"old").await.unwrap();
        store.put("/0/0/5", b"new").await.unwrap();
        assert_eq!(store.get("/0/0/5").await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_memory_reads_are_copies() {
        let store = MemoryStore::new();
        store.put("/0/0/3", b"der").await.unwrap();
        let mut copy = store.get("/0/0/3").await.unwrap();
        copy[0] = b'x';
        assert_eq!(store.get("/0/0/3").await.unwrap(), b"der");
    }
}
