use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use tokio::sync::RwLock;

use crate::types::StateStore;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

/// In-process store. Entries with a TTL expire lazily on access.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<RwLock<BTreeMap<String, Entry>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_entry<'a>(map: &'a BTreeMap<String, Entry>, key: &str) -> Option<&'a Entry> {
        map.get(key).filter(|e| e.live(Instant::now()))
    }

    fn purge_expired(map: &mut BTreeMap<String, Entry>, key: &str) {
        if map.get(key).map(|e| !e.live(Instant::now())).unwrap_or(false) {
            map.remove(key);
        }
    }

    fn hash_mut<'a>(
        map: &'a mut BTreeMap<String, Entry>,
        key: &str,
    ) -> Result<&'a mut HashMap<String, String>> {
        Self::purge_expired(map, key);
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Hash(h) => Ok(h),
            Value::Str(_) => bail!("WRONGTYPE key '{key}' holds a string"),
        }
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let map = self.inner.read().await;
        match Self::live_entry(&map, key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(Value::Hash(_)) => bail!("WRONGTYPE key '{key}' holds a hash"),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut map = self.inner.write().await;
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut map = self.inner.write().await;
        Self::purge_expired(&mut map, key);
        Ok(map.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let map = self.inner.read().await;
        Ok(Self::live_entry(&map, key).is_some())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut map = self.inner.write().await;
        Self::purge_expired(&mut map, key);
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Str("0".to_string()),
            expires_at: None,
        });
        let Value::Str(raw) = &mut entry.value else {
            bail!("WRONGTYPE key '{key}' holds a hash");
        };
        let Ok(current) = raw.parse::<i64>() else {
            bail!("value at '{key}' is not an integer");
        };
        let next = current.saturating_add(1);
        *raw = next.to_string();
        Ok(next)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let map = self.inner.read().await;
        match Self::live_entry(&map, key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Hash(h)) => Ok(h.get(field).cloned()),
            Some(Value::Str(_)) => bail!("WRONGTYPE key '{key}' holds a string"),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.hset_many(key, &[(field, value)]).await
    }

    async fn hset_many(&self, key: &str, fields: &[(&str, &str)]) -> Result<()> {
        let mut map = self.inner.write().await;
        let hash = Self::hash_mut(&mut map, key)?;
        for (f, v) in fields {
            hash.insert((*f).to_string(), (*v).to_string());
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let map = self.inner.read().await;
        match Self::live_entry(&map, key).map(|e| &e.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(h)) => Ok(h.clone()),
            Some(Value::Str(_)) => bail!("WRONGTYPE key '{key}' holds a string"),
        }
    }

    async fn hexists(&self, key: &str, field: &str) -> Result<bool> {
        Ok(self.hget(key, field).await?.is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let map = self.inner.read().await;
        let now = Instant::now();
        Ok(map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| e.live(now))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
