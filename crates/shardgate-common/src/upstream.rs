use rand::seq::SliceRandom;
use uuid::Uuid;

pub const API_VERSION: &str = "2";
pub const CHAT_STREAM_PATH: &str = "chat-stream";

const USER_AGENTS: &[&str] = &[
    "augment.intellij/0.160.0 (Mac OS X; aarch64; 15.2) GoLand/2024.3.5",
    "augment.intellij/0.160.0 (Mac OS X; aarch64; 15.2) WebStorm/2024.3.5",
    "augment.intellij/0.160.0 (Mac OS X; aarch64; 15.2) PyCharm/2024.3.5",
];

/// `tenant_url` is a base URL with a trailing slash, as stored on the credential.
pub fn chat_stream_url(tenant_url: &str) -> String {
    if tenant_url.ends_with('/') {
        format!("{tenant_url}{CHAT_STREAM_PATH}")
    } else {
        format!("{tenant_url}/{CHAT_STREAM_PATH}")
    }
}

/// POST to the shard's chat-stream endpoint with the vendor headers set.
/// Request and session ids are fresh per call.
pub fn chat_stream_request(
    http: &reqwest::Client,
    tenant_url: &str,
    token: &str,
) -> reqwest::RequestBuilder {
    let user_agent = USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0]);

    http.post(chat_stream_url(tenant_url))
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .bearer_auth(token)
        .header(reqwest::header::USER_AGENT, user_agent)
        .header("x-api-version", API_VERSION)
        .header("x-request-id", Uuid::new_v4().to_string())
        .header("x-request-session-id", Uuid::new_v4().to_string())
}
