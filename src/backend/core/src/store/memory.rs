//! In-memory state store for tests and single-process deployments.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::{conflict, Expected, StateStore, VersionedValue};
use crate::error::{ErrorCode, Result, TaskflowError};

/// Ordered map guarded by a mutex. Clones share the same data.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    entries: Arc<Mutex<BTreeMap<String, VersionedValue>>>,
    injected_failures: Arc<AtomicU32>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` operations fail with `StoreUnavailable`.
    pub fn fail_next(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn check_injected(&self) -> Result<()> {
        let injected = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(TaskflowError::detailed(
                ErrorCode::StoreUnavailable,
                "State store temporarily unavailable",
                "injected failure",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>> {
        self.check_injected()?;
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: serde_json::Value, expected: Expected) -> Result<u64> {
        self.check_injected()?;
        let mut entries = self.entries.lock();
        let current = entries.get(key).map(|v| v.version);
        if !expected.admits(current) {
            return Err(conflict(key, expected, current));
        }
        let version = current.unwrap_or(0) + 1;
        entries.insert(key.to_string(), VersionedValue { version, value });
        Ok(version)
    }

    async fn delete(&self, key: &str, expected_version: Option<u64>) -> Result<bool> {
        self.check_injected()?;
        let mut entries = self.entries.lock();
        let current = entries.get(key).map(|v| v.version);
        match (expected_version, current) {
            (_, None) => Ok(false),
            (Some(expected), Some(actual)) if expected != actual => {
                Err(conflict(key, Expected::Version(expected), Some(actual)))
            }
            _ => Ok(entries.remove(key).is_some()),
        }
    }

    async fn scan_range(
        &self,
        start: &str,
        end: &str,
        limit: Option<usize>,
    ) -> Result<Vec<(String, VersionedValue)>> {
        self.check_injected()?;
        if start >= end {
            return Ok(Vec::new());
        }
        let entries = self.entries.lock();
        let range = entries.range::<str, _>((Bound::Included(start), Bound::Excluded(end)));
        Ok(range
            .take(limit.unwrap_or(usize::MAX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_only_put() {
        let store = InMemoryStore::new();
        assert_eq!(store.put("a", json!(1), Expected::Absent).await.unwrap(), 1);

        let err = store.put("a", json!(2), Expected::Absent).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::VersionConflict);
        assert_eq!(store.get("a").await.unwrap().unwrap().value, json!(1));
    }

    #[tokio::test]
    async fn test_versioned_put_and_delete() {
        let store = InMemoryStore::new();
        store.put("k", json!("v1"), Expected::Absent).await.unwrap();
        assert_eq!(store.put("k", json!("v2"), Expected::Version(1)).await.unwrap(), 2);

        let stale = store.put("k", json!("v3"), Expected::Version(1)).await.unwrap_err();
        assert_eq!(stale.code(), ErrorCode::VersionConflict);

        assert!(store.delete("k", Some(1)).await.is_err());
        assert!(store.delete("k", Some(2)).await.unwrap());
        assert!(!store.delete("k", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_scan_is_ordered_and_bounded_by_prefix() {
        let store = InMemoryStore::new();
        for key in ["b/2", "a/1", "b/1", "c/1", "b/10"] {
            store.put(key, json!(key), Expected::Any).await.unwrap();
        }

        let keys: Vec<String> = store
            .scan("b/", None)
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["b/1", "b/10", "b/2"]);

        let limited = store.scan("b/", Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let store = InMemoryStore::new();
        store.fail_next(1);
        let err = store.get("x").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StoreUnavailable);
        assert!(err.is_retryable());
        assert!(store.get("x").await.unwrap().is_none());
    }
}
