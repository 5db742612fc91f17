use std::sync::Arc;

use chrono::Utc;
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use shardgate_common::credential::{FIELD_REMARK, FIELD_STATUS, FIELD_TENANT_URL};
use shardgate_common::{keys, mask_token, Credential, CredentialStatus, CredentialView};
use shardgate_store::StateStore;

use crate::Pool;

/// Bounded fan-out when loading records for the listing.
const LIST_CONCURRENCY: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("credential not found")]
    NotFound,
    #[error("state store unavailable: {0}")]
    Store(anyhow::Error),
}

impl From<anyhow::Error> for RegistryError {
    fn from(e: anyhow::Error) -> Self {
        RegistryError::Store(e)
    }
}

/// One item of a batch add, as posted by operators.
#[derive(Debug, Clone, Deserialize)]
pub struct NewCredential {
    #[serde(default)]
    pub token: String,
    #[serde(default, rename = "tenantUrl", alias = "tenant_url")]
    pub tenant_url: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct AddReport {
    pub total: usize,
    pub success_count: usize,
    pub failed_tokens: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenPage {
    pub tokens: Vec<CredentialView>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
}

/// CRUD over the credential records in the shared store.
#[derive(Clone)]
pub struct Registry {
    pool: Arc<Pool>,
}

impl Registry {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self { pool }
    }

    fn store(&self) -> &Arc<dyn StateStore> {
        self.pool.store()
    }

    /// Adds every well-formed item. Tokens already registered count as
    /// added and keep their current record.
    pub async fn add(&self, items: &[NewCredential]) -> AddReport {
        let mut report = AddReport {
            total: items.len(),
            ..AddReport::default()
        };

        for item in items {
            let token = item.token.trim();
            let tenant_url = item.tenant_url.trim();
            if token.is_empty() || tenant_url.is_empty() {
                report.failed_tokens.push(item.token.clone());
                continue;
            }
            match self.insert(token, tenant_url).await {
                Ok(()) => report.success_count += 1,
                Err(e) => {
                    tracing::warn!(token = %mask_token(token), error = %e, "failed to add credential");
                    report.failed_tokens.push(item.token.clone());
                }
            }
        }

        tracing::info!(
            total = report.total,
            added = report.success_count,
            failed = report.failed_tokens.len(),
            "credential batch processed"
        );
        report
    }

    async fn insert(&self, token: &str, tenant_url: &str) -> anyhow::Result<()> {
        let key = keys::credential(token);
        if self.store().exists(&key).await? {
            tracing::debug!(token = %mask_token(token), "credential already registered");
            return Ok(());
        }
        self.store()
            .hset_many(
                &key,
                &[
                    (FIELD_TENANT_URL, tenant_url),
                    (FIELD_STATUS, CredentialStatus::Active.as_str()),
                    (FIELD_REMARK, ""),
                ],
            )
            .await
    }

    /// Non-disabled credentials with their usage and cooldown, one page at a time.
    /// `page_size == 0` returns everything on a single page.
    pub async fn list(&self, page: usize, page_size: usize) -> Result<TokenPage, RegistryError> {
        let credential_keys = self.store().keys(keys::CREDENTIAL_PREFIX).await?;

        let mut views: Vec<CredentialView> = stream::iter(credential_keys)
            .map(move |key| async move { self.view(&key).await })
            .buffer_unordered(LIST_CONCURRENCY)
            .filter_map(|v| async move { v })
            .collect()
            .await;
        views.sort_by(|a, b| a.token.cmp(&b.token));

        let total = views.len();
        let (page, total_pages, tokens) = if page_size == 0 {
            (1, usize::from(total > 0), views)
        } else {
            let total_pages = total.div_ceil(page_size);
            let page = page.clamp(1, total_pages.max(1));
            let start = (page - 1) * page_size;
            let tokens = views.into_iter().skip(start).take(page_size).collect();
            (page, total_pages, tokens)
        };

        Ok(TokenPage {
            tokens,
            total,
            page,
            page_size,
            total_pages,
        })
    }

    /// Display row for one record; unreadable or disabled records are left out.
    async fn view(&self, key: &str) -> Option<CredentialView> {
        let token = keys::token_from_credential_key(key)?;
        let fields = self.store().hgetall(key).await.ok()?;
        if !fields.contains_key(FIELD_TENANT_URL) {
            return None;
        }
        let credential = Credential::from_fields(token, &fields);
        if credential.status == CredentialStatus::Disabled {
            return None;
        }

        let usage = self.pool.usage().counts(token).await.unwrap_or_default();
        let cool = self.pool.cool_state(token).await.unwrap_or_default();
        let in_cool = cool.is_cooling(Utc::now());

        Some(CredentialView {
            token: credential.token,
            tenant_url: credential.tenant_url,
            usage_count: usage.total,
            chat_usage_count: usage.chat,
            agent_usage_count: usage.agent,
            remark: credential.remark,
            in_cool,
            cool_end: in_cool.then_some(cool.cool_end),
        })
    }

    /// Removes the record and its usage counters.
    pub async fn delete(&self, token: &str) -> Result<(), RegistryError> {
        if !self.store().delete(&keys::credential(token)).await? {
            return Err(RegistryError::NotFound);
        }
        for key in [
            keys::usage_total(token),
            keys::usage_chat(token),
            keys::usage_agent(token),
        ] {
            self.store().delete(&key).await?;
        }
        tracing::info!(token = %mask_token(token), "credential deleted");
        Ok(())
    }

    pub async fn update_remark(&self, token: &str, remark: &str) -> Result<(), RegistryError> {
        let key = keys::credential(token);
        if !self.store().exists(&key).await? {
            return Err(RegistryError::NotFound);
        }
        self.store().hset(&key, FIELD_REMARK, remark).await?;
        Ok(())
    }

    pub async fn get(&self, token: &str) -> Result<Credential, RegistryError> {
        let fields = self.store().hgetall(&keys::credential(token)).await?;
        if fields.is_empty() {
            return Err(RegistryError::NotFound);
        }
        Ok(Credential::from_fields(token, &fields))
    }

    /// Gives every record a `remark` field. Run once at startup so older
    /// records render like new ones.
    pub async fn migrate_remarks(&self) -> anyhow::Result<usize> {
        let credential_keys = self.store().keys(keys::CREDENTIAL_PREFIX).await?;
        let mut migrated = 0;
        for key in &credential_keys {
            match self.store().hexists(key, FIELD_REMARK).await {
                Ok(true) => {}
                Ok(false) => match self.store().hset(key, FIELD_REMARK, "").await {
                    Ok(()) => migrated += 1,
                    Err(e) => tracing::error!(key = %key, error = %e, "remark migration failed"),
                },
                Err(e) => tracing::error!(key = %key, error = %e, "remark check failed"),
            }
        }
        tracing::info!(migrated, "remark migration done");
        Ok(migrated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::seed_credential;
    use crate::PoolLimits;
    use shardgate_common::Mode;
    use shardgate_store::MemoryStateStore;
    use std::time::Duration;

    fn registry() -> (Arc<dyn StateStore>, Registry) {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let pool = Pool::new(store.clone(), PoolLimits::default());
        (store, Registry::new(pool))
    }

    fn item(token: &str, url: &str) -> NewCredential {
        NewCredential {
            token: token.to_string(),
            tenant_url: url.to_string(),
        }
    }

    #[tokio::test]
    async fn test_list_runs_on_a_spawned_task() {
        let (_, registry) = registry();
        registry
            .add(&[item("a", "https://d1.example.com/"), item("b", "https://d2.example.com/")])
            .await;
        let page = tokio::spawn(async move { registry.list(1, 0).await })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.tokens.len(), 2);
    }

    #[tokio::test]
    async fn test_add_reports_partial_failures() {
        let (store, registry) = registry();
        store
            .hset(&keys::credential("old"), FIELD_TENANT_URL, "https://d9.example.com/")
            .await
            .unwrap();

        let report = registry
            .add(&[
                item("new", "https://d1.example.com/"),
                item("", "https://d1.example.com/"),
                item("no-url", ""),
                item("old", "https://d1.example.com/"),
            ])
            .await;

        assert_eq!(report.total, 4);
        assert_eq!(report.success_count, 2);
        assert_eq!(report.failed_tokens, vec!["".to_string(), "no-url".to_string()]);

        let added = registry.get("new").await.unwrap();
        assert_eq!(added.status, CredentialStatus::Active);
        assert_eq!(added.remark, "");
        // Existing records are not overwritten.
        assert_eq!(registry.get("old").await.unwrap().tenant_url, "https://d9.example.com/");
    }

    #[test]
    fn test_new_credential_accepts_both_spellings() {
        let a: NewCredential =
            serde_json::from_str(r#"{"token":"t","tenantUrl":"https://d1.example.com/"}"#).unwrap();
        let b: NewCredential =
            serde_json::from_str(r#"{"token":"t","tenant_url":"https://d1.example.com/"}"#).unwrap();
        assert_eq!(a.tenant_url, b.tenant_url);
    }

    #[tokio::test]
    async fn test_list_filters_disabled_and_paginates() {
        let (store, registry) = registry();
        for t in ["a", "b", "c"] {
            seed_credential(&store, t, "https://d1.example.com/").await;
        }
        seed_credential(&store, "dead", "https://d1.example.com/").await;
        store
            .hset(&keys::credential("dead"), FIELD_STATUS, "disabled")
            .await
            .unwrap();
        registry.pool.usage().charge("a", Mode::Chat).await.unwrap();
        registry
            .pool
            .set_cooldown("b", Duration::from_secs(60))
            .await
            .unwrap();

        let all = registry.list(1, 0).await.unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(all.total_pages, 1);
        let a = all.tokens.iter().find(|v| v.token == "a").unwrap();
        assert_eq!((a.usage_count, a.chat_usage_count), (1, 1));
        let b = all.tokens.iter().find(|v| v.token == "b").unwrap();
        assert!(b.in_cool && b.cool_end.is_some());

        let page = registry.list(2, 2).await.unwrap();
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.tokens.len(), 1);

        // Out-of-range pages clamp to the last one.
        let clamped = registry.list(9, 2).await.unwrap();
        assert_eq!(clamped.page, 2);
    }

    #[tokio::test]
    async fn test_delete_and_remark_not_found() {
        let (store, registry) = registry();
        seed_credential(&store, "t1", "https://d1.example.com/").await;
        registry.pool.usage().charge("t1", Mode::Agent).await.unwrap();

        registry.update_remark("t1", "team a").await.unwrap();
        assert_eq!(registry.get("t1").await.unwrap().remark, "team a");

        registry.delete("t1").await.unwrap();
        assert!(!store.exists(&keys::usage_agent("t1")).await.unwrap());
        assert!(!store.exists(&keys::usage_total("t1")).await.unwrap());

        assert!(matches!(registry.delete("t1").await, Err(RegistryError::NotFound)));
        assert!(matches!(
            registry.update_remark("t1", "x").await,
            Err(RegistryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_migrate_remarks_fills_missing_field() {
        let (store, registry) = registry();
        store
            .hset(&keys::credential("legacy"), FIELD_TENANT_URL, "https://d1.example.com/")
            .await
            .unwrap();
        seed_credential(&store, "fresh", "https://d2.example.com/").await;

        assert_eq!(registry.migrate_remarks().await.unwrap(), 1);
        assert!(store
            .hexists(&keys::credential("legacy"), FIELD_REMARK)
            .await
            .unwrap());
    }
}
