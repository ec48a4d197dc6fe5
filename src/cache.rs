use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands, RedisError};
use thiserror::Error;
use tokio::time::timeout;

const DEFAULT_CACHE_TIMEOUT_MILLISECS: u64 = 100;

/// Key for the backfill checkpoint: every source row with id below the
/// stored value has been enqueued for insertion.
pub const IMPORT_OFFSET_KEY: &str = "lastMigratedAuctionIndex";

/// Per-table migration cursors kept for operability of the legacy import.
pub fn migration_offset_key(table: &str) -> String {
    format!("auction_migration_{table}_offset")
}

pub fn migration_paging_key(table: &str) -> String {
    format!("auction_migration_{table}_paging_state")
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("not found in cache")]
    NotFound,
    #[error("parse error: {0}")]
    ParseError(String),
    #[error("cache error: {0}")]
    Other(String),
    #[error("timeout error")]
    Timeout,
}

impl From<RedisError> for CacheError {
    fn from(err: RedisError) -> Self {
        CacheError::Other(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for CacheError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        CacheError::Timeout
    }
}

/// The process-wide key-value cache the import offset and migration cursors
/// write through to.
#[async_trait]
pub trait CacheClient: Send + Sync + std::fmt::Debug {
    async fn get_i64(&self, key: &str) -> Result<i64, CacheError>;
    async fn set_i64(&self, key: &str, value: i64) -> Result<(), CacheError>;
    async fn get_string(&self, key: &str) -> Result<String, CacheError>;
    async fn set_string(&self, key: &str, value: &str) -> Result<(), CacheError>;
}

#[derive(Clone)]
pub struct RedisCache {
    connection: MultiplexedConnection,
    op_timeout: Duration,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache").finish_non_exhaustive()
    }
}

impl RedisCache {
    pub async fn new(addr: String) -> Result<Self, CacheError> {
        let client = redis::Client::open(addr)?;
        let connection = client.get_multiplexed_async_connection().await?;
        let op_timeout = std::env::var("REDIS_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(DEFAULT_CACHE_TIMEOUT_MILLISECS));
        Ok(Self {
            connection,
            op_timeout,
        })
    }
}

#[async_trait]
impl CacheClient for RedisCache {
    async fn get_i64(&self, key: &str) -> Result<i64, CacheError> {
        let mut conn = self.connection.clone();
        let value: Option<i64> = timeout(self.op_timeout, conn.get(key)).await??;
        value.ok_or(CacheError::NotFound)
    }

    async fn set_i64(&self, key: &str, value: i64) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        timeout(self.op_timeout, conn.set::<_, _, ()>(key, value)).await??;
        Ok(())
    }

    async fn get_string(&self, key: &str) -> Result<String, CacheError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = timeout(self.op_timeout, conn.get(key)).await??;
        value.ok_or(CacheError::NotFound)
    }

    async fn set_string(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        timeout(self.op_timeout, conn.set::<_, _, ()>(key, value)).await??;
        Ok(())
    }
}

/// In-memory stand-in used by tests and by deployments without redis.
#[derive(Debug, Default)]
pub struct MockCacheClient {
    entries: Mutex<HashMap<String, String>>,
}

impl MockCacheClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheClient for MockCacheClient {
    async fn get_i64(&self, key: &str) -> Result<i64, CacheError> {
        let entries = self.entries.lock().unwrap();
        let raw = entries.get(key).ok_or(CacheError::NotFound)?;
        raw.parse()
            .map_err(|_| CacheError::ParseError(format!("not an integer: {raw}")))
    }

    async fn set_i64(&self, key: &str, value: i64) -> Result<(), CacheError> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_string(&self, key: &str) -> Result<String, CacheError> {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or(CacheError::NotFound)
    }

    async fn set_string(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_cache_roundtrip() {
        let cache = MockCacheClient::new();
        assert_eq!(
            cache.get_i64(IMPORT_OFFSET_KEY).await,
            Err(CacheError::NotFound)
        );
        cache.set_i64(IMPORT_OFFSET_KEY, 42).await.unwrap();
        assert_eq!(cache.get_i64(IMPORT_OFFSET_KEY).await.unwrap(), 42);

        cache
            .set_string(&migration_paging_key("auctions"), "cursor")
            .await
            .unwrap();
        assert_eq!(
            cache
                .get_string(&migration_paging_key("auctions"))
                .await
                .unwrap(),
            "cursor"
        );
    }
}
