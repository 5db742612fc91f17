use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};

use crate::admin::{add_tokens, check_tokens, cool_token, delete_token, list_tokens, update_remark};
use crate::admission::admission_middleware;
use crate::handlers::{chat_completions, healthz, models};
use crate::metrics::{metrics_handler, track_requests};
use crate::state::AppState;

/// Leading slash added, trailing slashes dropped; empty means root.
pub fn normalize_prefix(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

pub fn build_app(st: AppState, route_prefix: &str) -> Router {
    let prefix = normalize_prefix(route_prefix);

    // Admission only wraps the completion routes.
    let completions = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1", post(chat_completions))
        .route("/v1/chat", post(chat_completions))
        .route_layer(middleware::from_fn_with_state(st.clone(), admission_middleware));

    let prefixed = Router::new()
        .merge(completions)
        .route("/v1/models", get(models))
        .route("/api/add/tokens", post(add_tokens));

    let operator = Router::new()
        .route("/api/tokens", get(list_tokens))
        .route("/api/token/:token", delete(delete_token))
        .route("/api/token/:token/remark", put(update_remark))
        .route("/api/token/:token/cool", post(cool_token))
        .route("/api/check-tokens", get(check_tokens));

    // `nest` rejects an empty path.
    let prefixed = if prefix.is_empty() {
        prefixed
    } else {
        Router::new().nest(&prefix, prefixed)
    };

    let authed_routes = prefixed.merge(operator).layer(middleware::from_fn_with_state(
        st.clone(),
        shardgate_common::auth::auth_middleware::<AppState>,
    ));

    let public_routes = Router::new()
        .route("/healthz", get(healthz))
        .route("/health", get(healthz))
        .route("/metrics", get(metrics_handler));

    public_routes
        .merge(authed_routes)
        .layer(middleware::from_fn_with_state(st.clone(), track_requests))
        .with_state(st)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use shardgate_common::auth::GatewayAuth;
    use shardgate_pool::strategy::parse_strategy;
    use shardgate_pool::{NewCredential, PoolLimits, ProberConfig};
    use shardgate_store::MemoryStateStore;
    use tower::ServiceExt;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn state(secret: Option<&str>) -> AppState {
        AppState::new(
            Arc::new(MemoryStateStore::new()),
            reqwest::Client::new(),
            GatewayAuth::new(secret.map(str::to_string)),
            parse_strategy("random").unwrap(),
            PoolLimits::default(),
            ProberConfig::default(),
        )
    }

    async fn add(st: &AppState, token: &str, tenant_url: String) {
        let report = st
            .registry
            .add(&[NewCredential {
                token: token.into(),
                tenant_url,
            }])
            .await;
        assert_eq!(report.success_count, 1);
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn wait_idle(st: &AppState, token: &str) -> bool {
        for _ in 0..100 {
            if !st.pool.request_state(token).await.unwrap().in_progress {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn chat_body(model: &str, stream: bool) -> Value {
        json!({
            "model": model,
            "stream": stream,
            "messages": [{"role": "user", "content": "hi"}]
        })
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("/"), "");
        assert_eq!(normalize_prefix("relay"), "/relay");
        assert_eq!(normalize_prefix("/relay/"), "/relay");
        assert_eq!(normalize_prefix(" /a/b// "), "/a/b");
    }

    #[tokio::test]
    async fn test_empty_pool_is_429() {
        let app = build_app(state(None), "");
        let resp = app
            .oneshot(post_json("/v1/chat/completions", chat_body("augment-chat", false)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            body_json(resp).await["error"],
            "no credential available, add a credential first"
        );
    }

    #[tokio::test]
    async fn test_gateway_secret() {
        let app = build_app(state(Some("s3cret")), "");

        let resp = app.clone().oneshot(get_req("/v1/models")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app.clone().oneshot(get_req("/api/tokens")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .clone()
            .oneshot(
                Request::get("/v1/models")
                    .header("authorization", "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let models = body_json(resp).await;
        assert_eq!(models["data"].as_array().unwrap().len(), 2);

        let resp = app.oneshot(get_req("/healthz")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_non_stream_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat-stream"))
            .and(header("authorization", "Bearer tok-1"))
            .and(header("x-api-version", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "{\"text\":\"Hel\",\"done\":false}\n{\"text\":\"lo\",\"done\":true}\n",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let st = state(None);
        add(&st, "tok-1", format!("{}/", server.uri())).await;
        let app = build_app(st.clone(), "");

        let resp = app
            .oneshot(post_json("/v1/chat/completions", chat_body("augment-chat", false)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["object"], "chat.completion");
        assert_eq!(v["model"], "augment-chat");
        assert_eq!(v["choices"][0]["message"]["content"], "Hello");
        assert_eq!(v["choices"][0]["finish_reason"], "stop");
        assert_eq!(v["usage"]["prompt_tokens"], 1);
        assert_eq!(v["usage"]["completion_tokens"], 1);
        assert_eq!(v["usage"]["total_tokens"], 2);

        let usage = st.pool.usage().counts("tok-1").await.unwrap();
        assert_eq!((usage.total, usage.chat, usage.agent), (1, 1, 0));
        assert!(!st.pool.request_state("tok-1").await.unwrap().in_progress);
    }

    #[tokio::test]
    async fn test_stream_completion_events() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat-stream"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "{\"text\":\"Hel\",\"done\":false}\n{\"text\":\"lo\",\"done\":true}\n",
            ))
            .mount(&server)
            .await;

        let st = state(None);
        add(&st, "tok-1", format!("{}/", server.uri())).await;
        let app = build_app(st.clone(), "");

        let resp = app
            .oneshot(post_json("/v1", chat_body("claude-3.7-agent", true)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let events: Vec<&str> = text
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .collect();

        assert_eq!(events.len(), 4, "{text}");
        let first: Value = serde_json::from_str(events[0]).unwrap();
        assert_eq!(first["object"], "chat.completion.chunk");
        assert_eq!(first["choices"][0]["delta"]["content"], "Hel");
        let second: Value = serde_json::from_str(events[1]).unwrap();
        assert_eq!(second["choices"][0]["delta"]["content"], "lo");
        let last_chunk: Value = serde_json::from_str(events[2]).unwrap();
        assert_eq!(last_chunk["choices"][0]["finish_reason"], "stop");
        assert_eq!(events[3], "[DONE]");

        assert!(wait_idle(&st, "tok-1").await);
        let usage = st.pool.usage().counts("tok-1").await.unwrap();
        assert_eq!((usage.total, usage.chat, usage.agent), (1, 0, 1));
    }

    #[tokio::test]
    async fn test_upstream_error_is_surfaced_and_released() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Invalid token"))
            .mount(&server)
            .await;

        let st = state(None);
        add(&st, "tok-1", format!("{}/", server.uri())).await;
        let app = build_app(st.clone(), "");

        let resp = app
            .oneshot(post_json("/v1/chat", chat_body("claude-3.7", false)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await["error"], "upstream error: Invalid token");

        assert!(!st.pool.request_state("tok-1").await.unwrap().in_progress);
        // Charged at dispatch even though the call failed.
        assert_eq!(st.pool.usage().counts("tok-1").await.unwrap().agent, 1);
        assert_eq!(
            st.metrics.upstream_errors.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_malformed_body_releases_credential() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let st = state(None);
        add(&st, "tok-1", format!("{}/", server.uri())).await;
        let app = build_app(st.clone(), "");

        let resp = app
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({"model": "augment-chat", "messages": "nope"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(resp).await["error"].is_string());

        let state = st.pool.request_state("tok-1").await.unwrap();
        assert!(!state.in_progress);
        assert_eq!(st.pool.usage().counts("tok-1").await.unwrap().total, 0);
        // The lock is free again.
        let lock = st.admission.locks().lock_for("tok-1");
        assert!(lock.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_route_prefix() {
        let app = build_app(state(None), "relay/");

        let resp = app.clone().oneshot(get_req("/relay/v1/models")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app.clone().oneshot(get_req("/v1/models")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .clone()
            .oneshot(post_json("/relay/v1/chat/completions", chat_body("augment-chat", false)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

        // Operator routes stay at the root.
        let resp = app.oneshot(get_req("/api/tokens")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_add_and_list_tokens() {
        let st = state(None);
        let app = build_app(st.clone(), "");

        let resp = app.clone().oneshot(post_json("/api/add/tokens", json!([]))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/add/tokens",
                json!([
                    {"token": "tok-a", "tenantUrl": "https://d1.example.com/"},
                    {"token": "", "tenantUrl": "https://d2.example.com/"}
                ]),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["total"], 2);
        assert_eq!(v["success_count"], 1);
        assert_eq!(v["failed_count"], 1);

        let resp = app.clone().oneshot(get_req("/api/tokens?page=1&page_size=5")).await.unwrap();
        let v = body_json(resp).await;
        assert_eq!(v["status"], "success");
        assert_eq!(v["total"], 1);
        assert_eq!(v["tokens"][0]["token"], "tok-a");
        assert_eq!(v["tokens"][0]["tenant_url"], "https://d1.example.com/");

        let resp = app
            .clone()
            .oneshot(
                Request::put("/api/token/tok-a/remark")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"remark": "team b"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(st.registry.get("tok-a").await.unwrap().remark, "team b");

        let resp = app
            .clone()
            .oneshot(post_json("/api/token/tok-a/cool", json!({"seconds": 60})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(st.pool.cool_state("tok-a").await.unwrap().in_cool);

        let resp = app
            .clone()
            .oneshot(Request::delete("/api/token/tok-a").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(Request::delete("/api/token/tok-a").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_without_page_size_returns_every_credential() {
        let st = state(None);
        for i in 0..15 {
            add(&st, &format!("tok-{i:02}"), format!("https://d{i}.example.com/")).await;
        }
        let app = build_app(st, "");

        let resp = app.clone().oneshot(get_req("/api/tokens")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["total"], 15);
        assert_eq!(v["tokens"].as_array().unwrap().len(), 15);
        assert_eq!(v["page"], 1);
        assert_eq!(v["page_size"], 0);
        assert_eq!(v["total_pages"], 1);

        // An explicit page size still pages.
        let resp = app.oneshot(get_req("/api/tokens?page=2&page_size=10")).await.unwrap();
        let v = body_json(resp).await;
        assert_eq!(v["tokens"].as_array().unwrap().len(), 5);
        assert_eq!(v["tokens"][0]["token"], "tok-10");
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let app = build_app(state(None), "");
        let _ = app.clone().oneshot(get_req("/healthz")).await.unwrap();

        let resp = app.oneshot(get_req("/metrics")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("# TYPE shardgate_requests_total counter"));
        assert!(text.contains("shardgate_responses_2xx 1"));
        assert!(text.contains("shardgate_credentials_disabled_total 0"));
    }
}
