use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use shardgate_common::{keys, Credential, Mode, RequestState};
use shardgate_store::StateStore;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{Pool, SelectError};

/// Lifetime of the busy flag in the store. Bounds how long a crashed
/// instance can keep a credential marked in progress.
pub const REQUEST_STATE_TTL: Duration = Duration::from_secs(3600);

/// One async mutex per token ever admitted in this process.
/// Entries are created on first use and never removed.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, token: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(token.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdmitError {
    #[error("no credential available, add a credential first")]
    NoCredential,
    #[error("too many requests, retry later")]
    PoolExhausted,
    #[error("state store unavailable: {0}")]
    Store(anyhow::Error),
}

impl From<SelectError> for AdmitError {
    fn from(e: SelectError) -> Self {
        match e {
            SelectError::NoCredential => AdmitError::NoCredential,
            SelectError::PoolExhausted => AdmitError::PoolExhausted,
            SelectError::Store(e) => AdmitError::Store(e),
        }
    }
}

/// Selects a credential and holds it exclusively for one upstream dispatch.
pub struct Admission {
    pool: Arc<Pool>,
    locks: Arc<LockTable>,
}

impl Admission {
    pub fn new(pool: Arc<Pool>, locks: Arc<LockTable>) -> Self {
        Self { pool, locks }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn locks(&self) -> &Arc<LockTable> {
        &self.locks
    }

    /// Select, lock, then mark busy in the store.
    ///
    /// Waits while another local request holds the same credential. If the
    /// busy flag cannot be written the lock is released before returning.
    pub async fn admit(&self, mode: Mode) -> Result<AdmissionGuard, AdmitError> {
        let credential = self.pool.select_credential(mode).await?;

        let lock = self.locks.lock_for(&credential.token).lock_owned().await;

        let store = self.pool.store().clone();
        if let Err(e) = write_state(&store, &credential.token, RequestState::busy(Utc::now())).await {
            drop(lock);
            tracing::error!(
                token = %credential.masked_token(),
                error = %e,
                "failed to mark credential busy"
            );
            return Err(AdmitError::Store(e));
        }

        tracing::debug!(token = %credential.masked_token(), mode = ?mode, "credential admitted");
        Ok(AdmissionGuard {
            lease: Some(Lease {
                token: credential.token.clone(),
                lock,
                store,
            }),
            credential,
        })
    }
}

async fn write_state(store: &Arc<dyn StateStore>, token: &str, state: RequestState) -> anyhow::Result<()> {
    let raw = serde_json::to_string(&state)?;
    store
        .set(&keys::request_state(token), &raw, Some(REQUEST_STATE_TTL))
        .await
}

struct Lease {
    token: String,
    lock: OwnedMutexGuard<()>,
    store: Arc<dyn StateStore>,
}

impl Lease {
    /// Marks the credential idle, then unlocks. The unlock happens whether
    /// or not the write succeeded.
    async fn release(self) {
        let Lease { token, lock, store } = self;
        if let Err(e) = write_state(&store, &token, RequestState::idle(Utc::now())).await {
            tracing::warn!(
                token = %shardgate_common::mask_token(&token),
                error = %e,
                "failed to mark credential idle"
            );
        }
        drop(lock);
    }
}

/// Exclusive hold on one credential. Call [`AdmissionGuard::release`] when
/// the dispatch is over; dropping the guard schedules the same release.
pub struct AdmissionGuard {
    credential: Credential,
    lease: Option<Lease>,
}

impl std::fmt::Debug for AdmissionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGuard")
            .field("token", &self.credential.masked_token())
            .field("released", &self.lease.is_none())
            .finish()
    }
}

impl AdmissionGuard {
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub async fn release(mut self) {
        if let Some(lease) = self.lease.take() {
            lease.release().await;
        }
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(lease.release());
            }
            Err(_) => {
                // Lock goes now; the busy flag is left to its TTL.
                tracing::warn!(
                    token = %self.credential.masked_token(),
                    "admission dropped outside a runtime"
                );
                drop(lease);
            }
        }
    }
}
