//! Store fixtures shared by the unit tests of this crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use shardgate_common::{keys, RequestState};
use shardgate_store::{MemoryStateStore, StateStore};

pub async fn seed_credential(store: &Arc<dyn StateStore>, token: &str, tenant_url: &str) {
    store
        .hset_many(
            &keys::credential(token),
            &[("tenant_url", tenant_url), ("status", "active"), ("remark", "")],
        )
        .await
        .unwrap();
}

pub async fn set_usage(store: &Arc<dyn StateStore>, token: &str, chat: u64, agent: u64) {
    store.set(&keys::usage_chat(token), &chat.to_string(), None).await.unwrap();
    store.set(&keys::usage_agent(token), &agent.to_string(), None).await.unwrap();
    store
        .set(&keys::usage_total(token), &(chat + agent).to_string(), None)
        .await
        .unwrap();
}

pub async fn set_request_state(store: &Arc<dyn StateStore>, token: &str, state: RequestState) {
    store
        .set(
            &keys::request_state(token),
            &serde_json::to_string(&state).unwrap(),
            None,
        )
        .await
        .unwrap();
}

/// Memory store whose string writes can be switched to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStateStore,
    fail_sets: AtomicBool,
}

impl FlakyStore {
    pub fn fail_sets(&self, fail: bool) {
        self.fail_sets.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        if self.fail_sets.load(Ordering::SeqCst) {
            bail!("connection reset while writing {key}");
        }
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.inner.incr(key).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.inner.hget(key, field).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.inner.hset(key, field, value).await
    }

    async fn hset_many(&self, key: &str, fields: &[(&str, &str)]) -> Result<()> {
        self.inner.hset_many(key, fields).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.inner.hgetall(key).await
    }

    async fn hexists(&self, key: &str, field: &str) -> Result<bool> {
        self.inner.hexists(key, field).await
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.keys(prefix).await
    }
}
