use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use shardgate_common::{keys, mask_token, Mode, UsageCounts};
use shardgate_store::StateStore;

/// Per-credential usage counters kept in the shared store.
#[derive(Clone)]
pub struct UsageLedger {
    store: Arc<dyn StateStore>,
}

impl UsageLedger {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Counts one dispatch against the mode counter and the total counter.
    pub async fn charge(&self, token: &str, mode: Mode) -> Result<()> {
        let mode_key = match mode {
            Mode::Chat => keys::usage_chat(token),
            Mode::Agent => keys::usage_agent(token),
        };
        self.store.incr(&mode_key).await?;
        self.store.incr(&keys::usage_total(token)).await?;
        Ok(())
    }

    pub async fn counts(&self, token: &str) -> Result<UsageCounts> {
        Ok(UsageCounts {
            total: self.counter(&keys::usage_total(token)).await?,
            chat: self.counter(&keys::usage_chat(token)).await?,
            agent: self.counter(&keys::usage_agent(token)).await?,
        })
    }

    async fn counter(&self, key: &str) -> Result<u64> {
        Ok(self
            .store
            .get(key)
            .await?
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0))
    }

    /// Zeroes the three counters of every registered credential.
    /// A failure on one credential is logged and the rest are still reset.
    pub async fn reset_all(&self) -> Result<usize> {
        let credential_keys = self.store.keys(keys::CREDENTIAL_PREFIX).await?;
        let mut reset = 0;
        for key in &credential_keys {
            let Some(token) = keys::token_from_credential_key(key) else {
                continue;
            };
            match self.reset_one(token).await {
                Ok(()) => reset += 1,
                Err(e) => {
                    tracing::error!(token = %mask_token(token), error = %e, "usage reset failed");
                }
            }
        }
        Ok(reset)
    }

    async fn reset_one(&self, token: &str) -> Result<()> {
        for key in [
            keys::usage_total(token),
            keys::usage_chat(token),
            keys::usage_agent(token),
        ] {
            self.store.set(&key, "0", None).await?;
        }
        Ok(())
    }

    /// Background loop resetting usage at 00:01 UTC on the 1st of every month.
    pub fn spawn_monthly_reset(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let next = next_monthly_reset(now);
                let wait = (next - now).to_std().unwrap_or_default();
                tracing::info!(next = %next, "usage reset scheduled");
                tokio::time::sleep(wait).await;

                match self.reset_all().await {
                    Ok(n) => tracing::info!(credentials = n, "monthly usage reset done"),
                    Err(e) => tracing::error!(error = %e, "monthly usage reset failed"),
                }
            }
        })
    }
}

/// The first 00:01 UTC on a 1st of the month strictly after `now`.
pub fn next_monthly_reset(now: DateTime<Utc>) -> DateTime<Utc> {
    let at = |year: i32, month: u32| {
        Utc.with_ymd_and_hms(year, month, 1, 0, 1, 0)
            .single()
            .unwrap_or(now)
    };
    let this_month = at(now.year(), now.month());
    if now < this_month {
        return this_month;
    }
    if now.month() == 12 {
        at(now.year() + 1, 1)
    } else {
        at(now.year(), now.month() + 1)
    }
}
