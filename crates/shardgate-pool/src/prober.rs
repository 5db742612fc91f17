use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use reqwest::StatusCode;
use serde::Serialize;
use shardgate_common::credential::{FIELD_STATUS, FIELD_TENANT_URL};
use shardgate_common::{keys, mask_token, upstream, CredentialStatus};
use shardgate_store::StateStore;
use tokio::task::JoinSet;

/// Placeholder replaced by the shard number in `shard_url_template`.
pub const SHARD_INDEX_PLACEHOLDER: &str = "{index}";

#[derive(Debug, Clone)]
pub struct ProberConfig {
    /// Base URL of a shard, e.g. `https://d{index}.api.augmentcode.com/`.
    pub shard_url_template: String,
    /// Shards are tried from this index down to 1.
    pub shard_count: u32,
    /// Body substring of a 401 that means the credential itself is dead.
    pub invalid_marker: String,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            shard_url_template: "https://d{index}.api.augmentcode.com/".to_string(),
            shard_count: 20,
            invalid_marker: "Invalid token".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub endpoint: String,
    pub previous: Option<String>,
}

impl ProbeOutcome {
    pub fn changed(&self) -> bool {
        self.previous.as_deref() != Some(self.endpoint.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("credential rejected by upstream")]
    CredentialInvalid,
    #[error("no valid endpoint found")]
    NoValidEndpoint,
    #[error("state store unavailable: {0}")]
    Store(anyhow::Error),
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ProbeSummary {
    pub total: usize,
    pub updated: usize,
    pub disabled: usize,
}

/// Finds the shard a credential is bound to and retires rejected credentials.
pub struct Prober {
    store: Arc<dyn StateStore>,
    http: reqwest::Client,
    config: ProberConfig,
    disabled_total: AtomicU64,
}

impl Prober {
    pub fn new(store: Arc<dyn StateStore>, http: reqwest::Client, config: ProberConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            http,
            config,
            disabled_total: AtomicU64::new(0),
        })
    }

    pub fn disabled_total(&self) -> u64 {
        self.disabled_total.load(Ordering::Relaxed)
    }

    /// Stored endpoint first, then every shard from the highest index down.
    pub fn candidates(&self, stored: Option<&str>) -> Vec<String> {
        let mut out: Vec<String> = stored.map(str::to_string).into_iter().collect();
        for i in (1..=self.config.shard_count).rev() {
            let url = self
                .config
                .shard_url_template
                .replace(SHARD_INDEX_PLACEHOLDER, &i.to_string());
            if !out.contains(&url) {
                out.push(url);
            }
        }
        out
    }

    /// Walks the candidate shards until one accepts the credential.
    ///
    /// A 401 carrying the invalid marker disables the credential and stops
    /// the walk. When nothing answers, the stored record is left as is.
    pub async fn probe_and_repair(&self, token: &str) -> Result<ProbeOutcome, ProbeError> {
        let key = keys::credential(token);
        let stored = self
            .store
            .hget(&key, FIELD_TENANT_URL)
            .await
            .map_err(ProbeError::Store)?
            .filter(|u| !u.is_empty());

        let payload = probe_payload();
        for url in self.candidates(stored.as_deref()) {
            let resp = match upstream::chat_stream_request(&self.http, &url, token)
                .json(&payload)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(token = %mask_token(token), url = %url, error = %e, "probe request failed");
                    continue;
                }
            };

            let status = resp.status();
            if status == StatusCode::UNAUTHORIZED {
                let body = first_chunk(resp).await;
                if String::from_utf8_lossy(&body).contains(&self.config.invalid_marker) {
                    self.disable(&key, token).await;
                    return Err(ProbeError::CredentialInvalid);
                }
                continue;
            }

            if status == StatusCode::OK && !first_chunk(resp).await.is_empty() {
                self.store
                    .hset_many(
                        &key,
                        &[
                            (FIELD_TENANT_URL, url.as_str()),
                            (FIELD_STATUS, CredentialStatus::Active.as_str()),
                        ],
                    )
                    .await
                    .map_err(ProbeError::Store)?;
                tracing::info!(token = %mask_token(token), endpoint = %url, "credential endpoint confirmed");
                return Ok(ProbeOutcome {
                    endpoint: url,
                    previous: stored,
                });
            }

            tracing::debug!(token = %mask_token(token), url = %url, status = status.as_u16(), "probe candidate rejected");
        }

        tracing::warn!(token = %mask_token(token), "no shard accepted the credential");
        Err(ProbeError::NoValidEndpoint)
    }

    async fn disable(&self, key: &str, token: &str) {
        if let Err(e) = self
            .store
            .hset(key, FIELD_STATUS, CredentialStatus::Disabled.as_str())
            .await
        {
            tracing::error!(token = %mask_token(token), error = %e, "failed to disable credential");
            return;
        }
        self.disabled_total.fetch_add(1, Ordering::Relaxed);
        tracing::info!(token = %mask_token(token), "credential disabled: upstream rejected it");
    }

    /// Probes every credential that is not already disabled, one task each.
    pub async fn probe_all(self: &Arc<Self>) -> Result<ProbeSummary, ProbeError> {
        let credential_keys = self
            .store
            .keys(keys::CREDENTIAL_PREFIX)
            .await
            .map_err(ProbeError::Store)?;

        let summary = Arc::new(Mutex::new(ProbeSummary {
            total: credential_keys.len(),
            ..ProbeSummary::default()
        }));

        let mut tasks = JoinSet::new();
        for key in credential_keys {
            let Some(token) = keys::token_from_credential_key(&key).map(str::to_string) else {
                continue;
            };
            if let Ok(Some(status)) = self.store.hget(&key, FIELD_STATUS).await {
                if CredentialStatus::parse(Some(&status)) == CredentialStatus::Disabled {
                    continue;
                }
            }

            let prober = Arc::clone(self);
            let summary = Arc::clone(&summary);
            tasks.spawn(async move {
                let result = prober.probe_and_repair(&token).await;
                let Ok(mut s) = summary.lock() else {
                    return;
                };
                match result {
                    Ok(outcome) if outcome.changed() => s.updated += 1,
                    Err(ProbeError::CredentialInvalid) => s.disabled += 1,
                    _ => {}
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "probe task failed");
            }
        }

        let summary = summary.lock().map(|s| *s).unwrap_or_default();
        tracing::info!(
            total = summary.total,
            updated = summary.updated,
            disabled = summary.disabled,
            "credential probe finished"
        );
        Ok(summary)
    }
}

/// First body read of a response, empty on error or EOF.
async fn first_chunk(mut resp: reqwest::Response) -> Vec<u8> {
    match resp.chunk().await {
        Ok(Some(bytes)) => bytes.to_vec(),
        _ => Vec::new(),
    }
}

/// Fixed chat payload with no tools and no history.
fn probe_payload() -> serde_json::Value {
    serde_json::json!({
        "message": "hello, what is your name",
        "mode": "CHAT",
        "prefix": "You are an AI assistant, help me to solve problems!",
        "suffix": " ",
        "lang": "HTML",
        "user_guidelines": "You are a helpful assistant.",
        "workspace_guidelines": "",
        "feature_detection_flags": { "support_raw_output": true },
        "tool_definitions": [],
        "blobs": {
            "checkpoint_id": null,
            "added_blobs": [],
            "deleted_blobs": [],
        },
    })
}
