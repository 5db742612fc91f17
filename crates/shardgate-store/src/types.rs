use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

/// Shared key-value state for the credential pool.
///
/// Every gateway instance pointed at the same store sees the same pool, so
/// nothing here may assume it is the only writer.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn incr(&self, key: &str) -> Result<i64>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    /// Writes all fields in one atomic operation.
    async fn hset_many(&self, key: &str, fields: &[(&str, &str)]) -> Result<()>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn hexists(&self, key: &str, field: &str) -> Result<bool>;

    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}
