//! Cross-run key-value persistence exposed to node bodies.
//!
//! The store is scoped beyond a single thread's checkpoint history: data put
//! here outlives runs and is shared across them. The scheduler never touches
//! it; node bodies reach it through their context.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use crate::error::Result;

/// Generic namespaced key-value persistence boundary.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>>;

    async fn put(&self, namespace: &str, key: &str, value: Value) -> Result<()>;

    async fn delete(&self, namespace: &str, key: &str) -> Result<()>;

    /// All `(key, value)` pairs in a namespace, sorted by key.
    async fn list(&self, namespace: &str) -> Result<Vec<(String, Value)>>;
}

/// In-memory reference implementation.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    data: Arc<RwLock<HashMap<String, HashMap<String, Value>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .data
            .read()
            .await
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    async fn put(&self, namespace: &str, key: &str, value: Value) -> Result<()> {
        self.data
            .write()
            .await
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        if let Some(ns) = self.data.write().await.get_mut(namespace) {
            ns.remove(key);
        }
        Ok(())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<(String, Value)>> {
        let data = self.data.read().await;
        let mut items: Vec<_> = data
            .get(namespace)
            .map(|ns| ns.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        items.sort_by(|a: &(String, Value), b| a.0.cmp(&b.0));
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_get_delete() {
        let store = InMemoryStore::new();
        store.put("users", "alice", json!({"visits": 1})).await.unwrap();
        assert_eq!(
            store.get("users", "alice").await.unwrap(),
            Some(json!({"visits": 1}))
        );

        store.delete("users", "alice").await.unwrap();
        assert_eq!(store.get("users", "alice").await.unwrap(), None);
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let store = InMemoryStore::new();
        store.put("a", "k", json!(1)).await.unwrap();
        assert_eq!(store.get("b", "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_sorted_by_key() {
        let store = InMemoryStore::new();
        store.put("ns", "b", json!(2)).await.unwrap();
        store.put("ns", "a", json!(1)).await.unwrap();
        let items = store.list("ns").await.unwrap();
        assert_eq!(items[0].0, "a");
        assert_eq!(items[1].0, "b");
    }
}
