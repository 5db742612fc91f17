use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use shardgate_common::{keys, CoolState, Credential, CredentialStatus, Mode, RequestState, UsageCounts};
use shardgate_store::StateStore;

pub mod admission;
pub mod prober;
pub mod registry;
pub mod strategy;
pub mod usage;

#[cfg(test)]
pub(crate) mod testing;

pub use admission::{AdmissionGuard, Admission, AdmitError, LockTable};
pub use prober::{ProbeError, ProbeOutcome, ProbeSummary, Prober, ProberConfig};
pub use registry::{AddReport, NewCredential, Registry, RegistryError, TokenPage};
pub use usage::UsageLedger;

use strategy::{Candidate, RandomPick, SelectionStrategy};

/// Concurrent per-credential reads while scanning the pool.
const SCAN_CONCURRENCY: usize = 10;

/// Eligibility thresholds applied on every selection.
#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    /// Minimum gap between two dispatches on one credential.
    pub min_spacing: Duration,
    pub chat_quota: u64,
    pub agent_quota: u64,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            min_spacing: Duration::from_secs(3),
            chat_quota: 3000,
            agent_quota: 50,
        }
    }
}

impl PoolLimits {
    fn quota(&self, mode: Mode) -> u64 {
        match mode {
            Mode::Chat => self.chat_quota,
            Mode::Agent => self.agent_quota,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    /// The registry holds no credential at all.
    #[error("no credential available, add a credential first")]
    NoCredential,
    /// Credentials exist but all are busy, spaced out, over quota or disabled.
    #[error("too many requests, retry later")]
    PoolExhausted,
    #[error("state store unavailable: {0}")]
    Store(anyhow::Error),
}

/// One credential that passed the eligibility filter.
struct Eligible {
    credential: Credential,
    usage: UsageCounts,
    cooling: bool,
}

pub struct Pool {
    store: Arc<dyn StateStore>,
    usage: UsageLedger,
    strategy: Box<dyn SelectionStrategy>,
    limits: PoolLimits,
    selections_total: AtomicU64,
    cooling_fallback_total: AtomicU64,
    exhausted_total: AtomicU64,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("strategy", &self.strategy.name())
            .field("limits", &self.limits)
            .finish()
    }
}

impl Pool {
    pub fn new(store: Arc<dyn StateStore>, limits: PoolLimits) -> Arc<Self> {
        Self::with_strategy(store, Box::new(RandomPick), limits)
    }

    pub fn with_strategy(
        store: Arc<dyn StateStore>,
        strategy: Box<dyn SelectionStrategy>,
        limits: PoolLimits,
    ) -> Arc<Self> {
        tracing::info!(
            strategy = strategy.name(),
            chat_quota = limits.chat_quota,
            agent_quota = limits.agent_quota,
            min_spacing_ms = limits.min_spacing.as_millis() as u64,
            "credential pool initialized"
        );
        Arc::new(Self {
            usage: UsageLedger::new(store.clone()),
            store,
            strategy,
            limits,
            selections_total: AtomicU64::new(0),
            cooling_fallback_total: AtomicU64::new(0),
            exhausted_total: AtomicU64::new(0),
        })
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn usage(&self) -> &UsageLedger {
        &self.usage
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn limits(&self) -> PoolLimits {
        self.limits
    }

    pub fn selections_total(&self) -> u64 {
        self.selections_total.load(Ordering::Relaxed)
    }

    pub fn cooling_fallback_total(&self) -> u64 {
        self.cooling_fallback_total.load(Ordering::Relaxed)
    }

    pub fn exhausted_total(&self) -> u64 {
        self.exhausted_total.load(Ordering::Relaxed)
    }

    /// Picks an eligible credential for `mode`.
    ///
    /// Credentials out of cooldown are always preferred; a cooling one is
    /// returned only when nothing else qualifies.
    pub async fn select_credential(&self, mode: Mode) -> Result<Credential, SelectError> {
        let credential_keys = self
            .store
            .keys(keys::CREDENTIAL_PREFIX)
            .await
            .map_err(SelectError::Store)?;
        if credential_keys.is_empty() {
            return Err(SelectError::NoCredential);
        }

        let now = Utc::now();
        let known = credential_keys.len();
        // Owned keys keep the scan future `Send` for any caller lifetime.
        let eligible: Vec<Eligible> = stream::iter(credential_keys)
            .map(move |key| async move { self.inspect(&key, mode, now).await })
            .buffered(SCAN_CONCURRENCY)
            .filter_map(|e| async move { e })
            .collect()
            .await;

        let (available, cooling): (Vec<Eligible>, Vec<Eligible>) =
            eligible.into_iter().partition(|e| !e.cooling);

        let tier = if !available.is_empty() {
            available
        } else if !cooling.is_empty() {
            self.cooling_fallback_total.fetch_add(1, Ordering::Relaxed);
            cooling
        } else {
            self.exhausted_total.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                mode = ?mode,
                known,
                "no eligible credential"
            );
            return Err(SelectError::PoolExhausted);
        };

        let candidates: Vec<Candidate> = tier
            .iter()
            .map(|e| Candidate {
                credential: &e.credential,
                usage: e.usage,
            })
            .collect();
        let idx = self
            .strategy
            .select(&candidates)
            .ok_or(SelectError::PoolExhausted)?;
        let chosen = tier[idx].credential.clone();

        self.selections_total.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            token = %chosen.masked_token(),
            mode = ?mode,
            strategy = self.strategy.name(),
            "credential selected"
        );
        Ok(chosen)
    }

    /// Applies the eligibility filter to one credential key.
    /// Any read failure drops the credential from this round.
    async fn inspect(&self, key: &str, mode: Mode, now: DateTime<Utc>) -> Option<Eligible> {
        let token = keys::token_from_credential_key(key)?;

        let fields = match self.store.hgetall(key).await {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(token = %shardgate_common::mask_token(token), error = %e, "skipping credential: read failed");
                return None;
            }
        };
        let credential = Credential::from_fields(token, &fields);
        if credential.status == CredentialStatus::Disabled || credential.tenant_url.is_empty() {
            return None;
        }

        let request_state = self.request_state(token).await.ok()?;
        if request_state.in_progress {
            return None;
        }
        let spacing = chrono::Duration::from_std(self.limits.min_spacing).unwrap_or(chrono::Duration::zero());
        if now - request_state.last_request_at < spacing {
            return None;
        }

        let usage = self.usage.counts(token).await.ok()?;
        if usage.for_mode(mode) >= self.limits.quota(mode) {
            return None;
        }

        let cooling = self.cool_state(token).await.ok()?.is_cooling(now);
        Some(Eligible {
            credential,
            usage,
            cooling,
        })
    }

    pub async fn request_state(&self, token: &str) -> anyhow::Result<RequestState> {
        Ok(self
            .store
            .get(&keys::request_state(token))
            .await?
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default())
    }

    pub async fn cool_state(&self, token: &str) -> anyhow::Result<CoolState> {
        Ok(self
            .store
            .get(&keys::cool_state(token))
            .await?
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default())
    }

    /// Puts a credential in cooldown; the state key expires with it.
    pub async fn set_cooldown(&self, token: &str, duration: Duration) -> anyhow::Result<CoolState> {
        let cool_end = Utc::now() + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
        let state = CoolState {
            in_cool: true,
            cool_end,
        };
        self.store
            .set(
                &keys::cool_state(token),
                &serde_json::to_string(&state)?,
                Some(duration),
            )
            .await?;
        tracing::info!(
            token = %shardgate_common::mask_token(token),
            cool_end = %cool_end,
            "credential cooling down"
        );
        Ok(state)
    }
}
