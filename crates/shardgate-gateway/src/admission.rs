//! Completion-route middleware that claims a credential before the handler runs.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use serde::Deserialize;
use shardgate_common::auth::{json_error, too_many_requests};
use shardgate_common::Mode;
use shardgate_pool::{AdmissionGuard, AdmitError};

use crate::state::AppState;

/// Completion bodies above this are refused before admission.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Carries the guard from the middleware to the handler. Request extensions
/// must be `Clone`, so the guard sits behind a shared take-once slot. If
/// nobody takes it, dropping the request drops the guard, which releases.
#[derive(Clone, Debug)]
pub struct AdmissionSlot(Arc<Mutex<Option<AdmissionGuard>>>);

impl AdmissionSlot {
    pub fn new(guard: AdmissionGuard) -> Self {
        Self(Arc::new(Mutex::new(Some(guard))))
    }

    pub fn take(&self) -> Option<AdmissionGuard> {
        self.0.lock().ok().and_then(|mut slot| slot.take())
    }
}

#[derive(Deserialize)]
struct ModelOnly {
    #[serde(default)]
    model: String,
}

/// Mode for the request body; unreadable bodies fall back to agent mode.
fn peek_mode(body: &[u8]) -> Mode {
    serde_json::from_slice::<ModelOnly>(body)
        .map(|m| Mode::from_model(&m.model))
        .unwrap_or(Mode::Agent)
}

pub fn admit_error_response(e: &AdmitError) -> Response {
    match e {
        AdmitError::NoCredential | AdmitError::PoolExhausted => too_many_requests(&e.to_string()),
        AdmitError::Store(_) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "state store unavailable")
        }
    }
}

pub async fn admission_middleware(
    State(st): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible> {
    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(error = %e, "failed to read completion body");
            return Ok(json_error(StatusCode::BAD_REQUEST, "invalid request body"));
        }
    };
    let mode = peek_mode(&bytes);

    let guard = match st.admission.admit(mode).await {
        Ok(g) => g,
        Err(e) => {
            match &e {
                AdmitError::NoCredential => {
                    st.metrics.admissions_no_credential.fetch_add(1, Ordering::Relaxed);
                }
                AdmitError::PoolExhausted => {
                    st.metrics.admissions_exhausted.fetch_add(1, Ordering::Relaxed);
                }
                AdmitError::Store(err) => {
                    tracing::error!(error = %err, "admission failed on state store");
                }
            }
            return Ok(admit_error_response(&e));
        }
    };
    st.metrics.admissions_granted.fetch_add(1, Ordering::Relaxed);

    let mut req = Request::from_parts(parts, Body::from(bytes));
    req.extensions_mut().insert(AdmissionSlot::new(guard));
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peek_mode() {
        assert_eq!(peek_mode(br#"{"model":"augment-chat"}"#), Mode::Chat);
        assert_eq!(peek_mode(br#"{"model":"claude-3.7-agent"}"#), Mode::Agent);
        assert_eq!(peek_mode(br#"{"messages":[]}"#), Mode::Agent);
        assert_eq!(peek_mode(b"not json"), Mode::Agent);
    }

    #[test]
    fn test_error_statuses() {
        assert_eq!(
            admit_error_response(&AdmitError::NoCredential).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            admit_error_response(&AdmitError::PoolExhausted).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            admit_error_response(&AdmitError::Store(anyhow::anyhow!("down"))).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
