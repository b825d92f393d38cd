//! In-memory blob store

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use stampede_core::traits::{BlobError, BlobStore};

/// Process-local blob store backed by sorted maps
///
/// Intended for tests and dry runs. Overwrites are last-writer-wins and
/// listing is lexicographic, matching the real stores. Safe for
/// concurrent use.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    namespaces: Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects across all namespaces
    pub fn len(&self) -> usize {
        self.namespaces
            .lock()
            .expect("namespace lock")
            .values()
            .map(|objects| objects.len())
            .sum()
    }

    /// Whether the store holds no objects
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, namespace: &str, name: &str, bytes: &[u8]) -> Result<(), BlobError> {
        self.namespaces
            .lock()
            .expect("namespace lock")
            .entry(namespace.to_string())
            .or_default()
            .insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Vec<u8>, BlobError> {
        self.namespaces
            .lock()
            .expect("namespace lock")
            .get(namespace)
            .and_then(|objects| objects.get(name))
            .cloned()
            .ok_or_else(|| BlobError::NotFound(format!("{namespace}/{name}")))
    }

    async fn list(&self, namespace: &str, prefix: &str) -> Result<Vec<String>, BlobError> {
        Ok(self
            .namespaces
            .lock()
            .expect("namespace lock")
            .get(namespace)
            .map(|objects| {
                objects
                    .keys()
                    .filter(|name| name.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn exists(&self, namespace: &str, name: &str) -> Result<bool, BlobError> {
        Ok(self
            .namespaces
            .lock()
            .expect("namespace lock")
            .get(namespace)
            .is_some_and(|objects| objects.contains_key(name)))
    }
}
