use std::sync::Arc;

use shardgate_common::auth::GatewayAuth;
use shardgate_pool::strategy::SelectionStrategy;
use shardgate_pool::{Admission, LockTable, Pool, PoolLimits, Prober, ProberConfig, Registry};
use shardgate_store::StateStore;

use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<Pool>,
    pub admission: Arc<Admission>,
    pub registry: Registry,
    pub prober: Arc<Prober>,
    pub http: reqwest::Client,
    pub auth: GatewayAuth,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn StateStore>,
        http: reqwest::Client,
        auth: GatewayAuth,
        strategy: Box<dyn SelectionStrategy>,
        limits: PoolLimits,
        prober_config: ProberConfig,
    ) -> Self {
        let pool = Pool::with_strategy(store.clone(), strategy, limits);
        let admission = Arc::new(Admission::new(pool.clone(), Arc::new(LockTable::new())));
        let registry = Registry::new(pool.clone());
        let prober = Prober::new(store, http.clone(), prober_config);
        Self {
            pool,
            admission,
            registry,
            prober,
            http,
            auth,
            metrics: Arc::new(Metrics::default()),
        }
    }
}

impl AsRef<GatewayAuth> for AppState {
    fn as_ref(&self) -> &GatewayAuth {
        &self.auth
    }
}
