use clap::Parser;
use shardgate_common::telemetry::LogFormat;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    #[arg(long, env = "SHARDGATE_LISTEN_ADDR", default_value = "0.0.0.0:27080")]
    pub listen_addr: String,

    /// Redis connection string. Without it state lives in process memory.
    #[arg(long, env = "REDIS_CONN_STRING")]
    pub redis_url: Option<String>,

    /// Bearer secret required on every non-public route. Unset means open.
    #[arg(long, env = "AUTH_TOKEN")]
    pub auth_token: Option<String>,

    #[arg(long, env = "ROUTE_PREFIX", default_value = "")]
    pub route_prefix: String,

    /// Outbound proxy for upstream calls.
    #[arg(long, env = "PROXY_URL")]
    pub proxy_url: Option<String>,

    #[arg(long, env = "SHARDGATE_SELECTION_STRATEGY", default_value = "random")]
    pub selection_strategy: String,

    #[arg(
        long,
        env = "SHARDGATE_SHARD_URL_TEMPLATE",
        default_value = "https://d{index}.api.augmentcode.com/"
    )]
    pub shard_url_template: String,

    #[arg(long, env = "SHARDGATE_SHARD_COUNT", default_value_t = 20)]
    pub shard_count: u32,

    #[arg(long, env = "SHARDGATE_CHAT_QUOTA", default_value_t = 3000)]
    pub chat_quota: u64,

    #[arg(long, env = "SHARDGATE_AGENT_QUOTA", default_value_t = 50)]
    pub agent_quota: u64,

    #[arg(long, env = "SHARDGATE_MIN_REQUEST_SPACING_MS", default_value_t = 3000)]
    pub min_request_spacing_ms: u64,

    /// Longest silence allowed between upstream reads. Streams may run longer.
    #[arg(long, env = "SHARDGATE_READ_TIMEOUT_SECS", default_value_t = 300)]
    pub read_timeout_secs: u64,

    /// `text` or `json`.
    #[arg(long, env = "SHARDGATE_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    /// OTLP/HTTP endpoint for exporting traces.
    #[arg(long, env = "OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Bearer token for the OTLP collector.
    #[arg(long, env = "OTLP_TOKEN")]
    pub otlp_token: Option<String>,
}
