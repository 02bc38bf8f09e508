//! Redis-backed state store.
//!
//! Each logical key is a hash (`v` = version, `d` = JSON) under
//! `{prefix}:kv:{key}`. A sorted set with every member at score 0 indexes the
//! logical keys so prefix and range scans are `ZRANGEBYLEX` queries. Conditional
//! writes run as Lua scripts, which Redis executes atomically.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use serde::{Deserialize, Serialize};

use super::{conflict, Expected, StateStore, VersionedValue};
use crate::error::{ErrorCode, Result, TaskflowError};

const PUT_SCRIPT: &str = r#"
local cur = redis.call('HGET', KEYS[1], 'v')
local mode = ARGV[1]
if mode == 'absent' and cur then
  return {0, tonumber(cur)}
end
if mode == 'version' and (not cur or cur ~= ARGV[2]) then
  return {0, cur and tonumber(cur) or -1}
end
local nv = 1
if cur then nv = tonumber(cur) + 1 end
redis.call('HSET', KEYS[1], 'v', nv, 'd', ARGV[3])
redis.call('ZADD', KEYS[2], 0, ARGV[4])
return {1, nv}
"#;

const DELETE_SCRIPT: &str = r#"
local cur = redis.call('HGET', KEYS[1], 'v')
if not cur then
  return {0, -1}
end
if ARGV[1] ~= '' and cur ~= ARGV[1] then
  return {2, tonumber(cur)}
end
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], ARGV[2])
return {1, tonumber(cur)}
"#;

/// Connection settings for [`RedisStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisStoreConfig {
    pub url: String,
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "taskflow".to_string(),
        }
    }
}

/// Redis state store. Cheap to clone; clones share one managed connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    key_prefix: String,
    put_script: Script,
    delete_script: Script,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager, key_prefix: impl Into<String>) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.into(),
            put_script: Script::new(PUT_SCRIPT),
            delete_script: Script::new(DELETE_SCRIPT),
        }
    }

    /// Open a client and a managed connection.
    pub async fn connect(config: &RedisStoreConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = ConnectionManager::new(client).await.map_err(|e| {
            TaskflowError::detailed(
                ErrorCode::StoreUnavailable,
                "Failed to connect state store to Redis",
                e.to_string(),
            )
        })?;
        tracing::info!(key_prefix = %config.key_prefix, "Redis state store connected");
        Ok(Self::new(conn, config.key_prefix.clone()))
    }

    fn data_key(&self, key: &str) -> String {
        format!("{}:kv:{}", self.key_prefix, key)
    }

    fn index_key(&self) -> String {
        format!("{}:kv-index", self.key_prefix)
    }

    fn decode(key: &str, version: Option<u64>, data: Option<String>) -> Result<Option<VersionedValue>> {
        match (version, data) {
            (Some(version), Some(data)) => {
                let value = serde_json::from_str(&data)
                    .map_err(|e| TaskflowError::from(e).with_context("key", key))?;
                Ok(Some(VersionedValue { version, value }))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>> {
        let mut conn = self.conn.clone();
        let (version, data): (Option<u64>, Option<String>) = redis::cmd("HMGET")
            .arg(self.data_key(key))
            .arg("v")
            .arg("d")
            .query_async(&mut conn)
            .await?;
        Self::decode(key, version, data)
    }

    async fn put(&self, key: &str, value: serde_json::Value, expected: Expected) -> Result<u64> {
        let (mode, expected_version) = match expected {
            Expected::Absent => ("absent", String::new()),
            Expected::Version(v) => ("version", v.to_string()),
            Expected::Any => ("any", String::new()),
        };
        let data = serde_json::to_string(&value)?;

        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .put_script
            .key(self.data_key(key))
            .key(self.index_key())
            .arg(mode)
            .arg(expected_version)
            .arg(data)
            .arg(key)
            .invoke_async(&mut conn)
            .await?;

        match reply.as_slice() {
            [1, version] => Ok(*version as u64),
            [0, current] => Err(conflict(key, expected, u64::try_from(*current).ok())),
            other => Err(TaskflowError::internal(format!(
                "unexpected put script reply {:?}",
                other
            ))),
        }
    }

    async fn delete(&self, key: &str, expected_version: Option<u64>) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .delete_script
            .key(self.data_key(key))
            .key(self.index_key())
            .arg(expected_version.map(|v| v.to_string()).unwrap_or_default())
            .arg(key)
            .invoke_async(&mut conn)
            .await?;

        match reply.as_slice() {
            [0, _] => Ok(false),
            [1, _] => Ok(true),
            [2, current] => Err(conflict(
                key,
                expected_version.map(Expected::Version).unwrap_or(Expected::Any),
                u64::try_from(*current).ok(),
            )),
            other => Err(TaskflowError::internal(format!(
                "unexpected delete script reply {:?}",
                other
            ))),
        }
    }

    async fn scan_range(
        &self,
        start: &str,
        end: &str,
        limit: Option<usize>,
    ) -> Result<Vec<(String, VersionedValue)>> {
        if start >= end {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("ZRANGEBYLEX");
        cmd.arg(self.index_key())
            .arg(format!("[{}", start))
            .arg(format!("({}", end));
        if let Some(limit) = limit {
            cmd.arg("LIMIT").arg(0).arg(limit);
        }
        let keys: Vec<String> = cmd.query_async(&mut conn).await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.cmd("HMGET").arg(self.data_key(key)).arg("v").arg("d");
        }
        let rows: Vec<(Option<u64>, Option<String>)> = pipe.query_async(&mut conn).await?;

        let mut out = Vec::with_capacity(keys.len());
        for (key, (version, data)) in keys.into_iter().zip(rows) {
            // A key deleted between the index read and the fetch is skipped.
            if let Some(value) = Self::decode(&key, version, data)? {
                out.push((key, value));
            }
        }
        Ok(out)
    }
}
