use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

// ── GatewayAuth ─────────────────────────────────────────────────────

/// Bearer secret clients must present. `None` leaves the gateway open.
#[derive(Debug, Clone, Default)]
pub struct GatewayAuth {
    secret: Option<Arc<str>>,
}

impl GatewayAuth {
    pub fn new(secret: Option<String>) -> Self {
        let secret = secret
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(Arc::from);
        if secret.is_none() {
            tracing::warn!("auth disabled: no gateway secret configured");
        }
        Self { secret }
    }

    pub fn enabled(&self) -> bool {
        self.secret.is_some()
    }

    fn accepts(&self, presented: &str) -> bool {
        self.secret.as_deref().map(|s| s == presented).unwrap_or(true)
    }
}

impl AsRef<GatewayAuth> for GatewayAuth {
    fn as_ref(&self) -> &GatewayAuth {
        self
    }
}

// ── Middleware ───────────────────────────────────────────────────────
// Generic over any state type S that implements AsRef<GatewayAuth>.
// Usage: `middleware::from_fn_with_state(app_state, auth_middleware::<MyAppState>)`

pub async fn auth_middleware<S>(
    State(state): State<S>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible>
where
    S: AsRef<GatewayAuth> + Clone + Send + Sync + 'static,
{
    let auth = state.as_ref();

    if !auth.enabled() {
        return Ok(next.run(req).await);
    }

    let Some(token) = extract_token(&req) else {
        tracing::warn!(path = %req.uri().path(), "request without authorization header");
        return Ok(unauthorized("Authorization header is required"));
    };

    if !auth.accepts(&token) {
        tracing::warn!(path = %req.uri().path(), "request with invalid gateway token");
        return Ok(unauthorized("Invalid authorization token"));
    }

    Ok(next.run(req).await)
}

fn extract_token(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim().to_string())
        .or_else(|| {
            req.headers()
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
}

// ── Error helpers ───────────────────────────────────────────────────

/// The one error envelope every route uses: `{"error": "<message>"}`.
pub fn json_error(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": msg.into() }))).into_response()
}

pub fn unauthorized(msg: &str) -> Response {
    json_error(StatusCode::UNAUTHORIZED, msg)
}

pub fn too_many_requests(msg: &str) -> Response {
    json_error(StatusCode::TOO_MANY_REQUESTS, msg)
}
