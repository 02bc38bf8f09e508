//! Versioned key-value state store.
//!
//! Every consumer keeps its derived state (ledger rows, cursors, audit rows,
//! schedules) behind this interface. Concurrency control is optimistic: each
//! key carries a version and writes state what they expect to find, so two
//! engine instances racing on the same key resolve through a
//! `VersionConflict` instead of a lock.
//!
//! Backends:
//! - **InMemoryStore**: ordered map, used by tests and single-process runs
//! - **RedisStore**: hashes plus a lexicographic key index, with Lua scripts for
//!   the conditional writes

pub mod keys;
pub mod memory;
pub mod redis;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{ErrorCode, Result, TaskflowError};

pub use memory::InMemoryStore;
pub use self::redis::{RedisStore, RedisStoreConfig};

/// A stored value and the version it was written at.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedValue {
    pub version: u64,
    pub value: serde_json::Value,
}

/// Precondition for a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    /// The key must not exist (create-only).
    Absent,
    /// The key must exist at exactly this version.
    Version(u64),
    /// Unconditional upsert.
    Any,
}

impl Expected {
    /// Whether a key currently at `current` satisfies this precondition.
    pub fn admits(&self, current: Option<u64>) -> bool {
        match (self, current) {
            (Self::Any, _) => true,
            (Self::Absent, None) => true,
            (Self::Version(v), Some(c)) => *v == c,
            _ => false,
        }
    }

    fn as_option(&self) -> Option<u64> {
        match self {
            Self::Version(v) => Some(*v),
            _ => None,
        }
    }
}

/// Key-value store with optimistic conditional writes and ordered scans.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a key.
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>>;

    /// Write a key if `expected` holds, returning the new version.
    ///
    /// Fails with `VersionConflict` when the precondition does not hold.
    async fn put(&self, key: &str, value: serde_json::Value, expected: Expected) -> Result<u64>;

    /// Delete a key, optionally only at a given version. Returns whether a key was removed.
    async fn delete(&self, key: &str, expected_version: Option<u64>) -> Result<bool>;

    /// Keys in `[start, end)` in lexicographic order.
    async fn scan_range(
        &self,
        start: &str,
        end: &str,
        limit: Option<usize>,
    ) -> Result<Vec<(String, VersionedValue)>>;

    /// All keys starting with `prefix`, in lexicographic order.
    async fn scan(&self, prefix: &str, limit: Option<usize>) -> Result<Vec<(String, VersionedValue)>> {
        self.scan_range(prefix, &prefix_end(prefix), limit).await
    }
}

/// Smallest string greater than every string starting with `prefix`.
pub fn prefix_end(prefix: &str) -> String {
    let mut end = prefix.to_string();
    end.push(char::MAX);
    end
}

impl dyn StateStore {
    /// Read and deserialize a key.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<(u64, T)>> {
        match self.get(key).await? {
            Some(stored) => Ok(Some((stored.version, decode_value(key, stored.value)?))),
            None => Ok(None),
        }
    }

    /// Serialize and conditionally write a key.
    pub async fn put_as<T: Serialize + Sync>(&self, key: &str, value: &T, expected: Expected) -> Result<u64> {
        let json = serde_json::to_value(value)?;
        self.put(key, json, expected).await
    }

    /// Scan a prefix and deserialize every value.
    pub async fn scan_as<T: DeserializeOwned>(
        &self,
        prefix: &str,
        limit: Option<usize>,
    ) -> Result<Vec<(String, u64, T)>> {
        self.scan(prefix, limit)
            .await?
            .into_iter()
            .map(|(key, stored)| {
                let value = decode_value(&key, stored.value)?;
                Ok((key, stored.version, value))
            })
            .collect()
    }

    /// Delete every value under `prefix` for which `expired` holds. A value
    /// rewritten after the scan is kept. Returns how many were removed.
    pub async fn delete_where<T, F>(&self, prefix: &str, expired: F) -> Result<usize>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> bool,
    {
        let mut removed = 0;
        for (key, version, value) in self.scan_as::<T>(prefix, None).await? {
            if !expired(&value) {
                continue;
            }
            match self.delete(&key, Some(version)).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) if e.code() == ErrorCode::VersionConflict => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }
}

fn decode_value<T: DeserializeOwned>(key: &str, value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| {
        TaskflowError::from(e).with_context("key", key)
    })
}

/// Build the conflict error the backends return.
pub(crate) fn conflict(key: &str, expected: Expected, actual: Option<u64>) -> TaskflowError {
    TaskflowError::version_conflict(key, expected.as_option(), actual)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_admits() {
        assert!(Expected::Absent.admits(None));
        assert!(!Expected::Absent.admits(Some(1)));
        assert!(Expected::Version(3).admits(Some(3)));
        assert!(!Expected::Version(3).admits(Some(4)));
        assert!(!Expected::Version(3).admits(None));
        assert!(Expected::Any.admits(None));
        assert!(Expected::Any.admits(Some(9)));
    }

    #[test]
    fn test_prefix_end_bounds_prefix() {
        let end = prefix_end("audit/");
        assert!("audit/zzz" < end.as_str());
        assert!("audit0" > end.as_str());
    }
}
