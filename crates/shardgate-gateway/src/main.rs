mod admin;
mod admission;
mod app;
mod args;
mod handlers;
mod metrics;
mod openai;
mod relay;
mod state;
mod tokens;
mod tools;
mod translate;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use shardgate_common::auth::GatewayAuth;
use shardgate_pool::strategy::parse_strategy;
use shardgate_pool::{PoolLimits, ProberConfig};
use shardgate_store::{MemoryStateStore, RedisStateStore, StateStore};

use crate::args::Args;
use crate::state::AppState;

fn build_http_client(args: &Args) -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(3))
        .read_timeout(Duration::from_secs(args.read_timeout_secs));

    if let Some(proxy_url) = args.proxy_url.as_deref().filter(|u| !u.trim().is_empty()) {
        match reqwest::Proxy::all(proxy_url) {
            Ok(proxy) => {
                tracing::info!(proxy = %proxy_url, "upstream calls go through proxy");
                builder = builder.proxy(proxy);
            }
            Err(e) => tracing::warn!(proxy = %proxy_url, error = %e, "invalid proxy url, ignoring"),
        }
    }

    builder.build().unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to build reqwest client");
        std::process::exit(1);
    })
}

async fn connect_store(redis_url: Option<&str>) -> anyhow::Result<Arc<dyn StateStore>> {
    match redis_url.filter(|u| !u.trim().is_empty()) {
        Some(url) => {
            let store = RedisStateStore::connect(url).await?;
            tracing::info!("connected to redis state store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!(
                "REDIS_CONN_STRING not set, using in-memory state (single instance only)"
            );
            Ok(Arc::new(MemoryStateStore::new()))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let otel_provider = shardgate_common::telemetry::init_tracing(
        "shardgate",
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
        args.log_format,
    );

    let store = connect_store(args.redis_url.as_deref()).await?;

    let strategy = parse_strategy(&args.selection_strategy).unwrap_or_else(|e| {
        tracing::error!(error = %e, "invalid selection strategy");
        std::process::exit(1);
    });

    let limits = PoolLimits {
        min_spacing: Duration::from_millis(args.min_request_spacing_ms),
        chat_quota: args.chat_quota,
        agent_quota: args.agent_quota,
    };
    let prober_config = ProberConfig {
        shard_url_template: args.shard_url_template.clone(),
        shard_count: args.shard_count,
        ..ProberConfig::default()
    };

    let http = build_http_client(&args);
    let auth = GatewayAuth::new(args.auth_token.clone());
    let st = AppState::new(store, http, auth, strategy, limits, prober_config);

    if let Err(e) = st.registry.migrate_remarks().await {
        tracing::error!(error = %e, "remark migration failed");
    }
    let _reset_task = st.pool.usage().clone().spawn_monthly_reset();

    let app = app::build_app(st, &args.route_prefix);

    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    tracing::info!(
        addr = %args.listen_addr,
        prefix = %app::normalize_prefix(&args.route_prefix),
        strategy = %args.selection_strategy,
        "shardgate listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(provider) = otel_provider {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = %e, "failed to flush traces");
        }
    }
    Ok(())
}
