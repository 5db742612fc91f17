//! Operator endpoints over the credential registry.

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use shardgate_common::auth::json_error;
use shardgate_common::mask_token;
use shardgate_pool::{NewCredential, ProbeError, RegistryError};

use crate::state::AppState;

fn registry_error(e: RegistryError) -> Response {
    match e {
        RegistryError::NotFound => json_error(StatusCode::NOT_FOUND, "token not found"),
        RegistryError::Store(err) => {
            tracing::error!(error = %err, "registry store operation failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "state store unavailable")
        }
    }
}

/// JSON bodies are parsed by hand so rejections keep the error envelope.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, Response> {
    serde_json::from_slice(body)
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, format!("invalid request body: {e}")))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub page_size: Option<usize>,
}

pub async fn list_tokens(State(st): State<AppState>, Query(q): Query<ListQuery>) -> Response {
    let page = q.page.unwrap_or(1);
    // No page size lists every credential on one page.
    let page_size = q.page_size.unwrap_or(0);
    match st.registry.list(page, page_size).await {
        Ok(p) => Json(json!({
            "status": "success",
            "tokens": p.tokens,
            "total": p.total,
            "page": p.page,
            "page_size": p.page_size,
            "total_pages": p.total_pages,
        }))
        .into_response(),
        Err(e) => registry_error(e),
    }
}

pub async fn add_tokens(State(st): State<AppState>, body: Bytes) -> Response {
    let items: Vec<NewCredential> = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if items.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "token list is empty");
    }

    let report = st.registry.add(&items).await;
    let mut out = json!({
        "status": "success",
        "total": report.total,
        "success_count": report.success_count,
    });
    if !report.failed_tokens.is_empty() {
        out["failed_count"] = json!(report.failed_tokens.len());
        out["failed_tokens"] = json!(report.failed_tokens);
    }
    Json(out).into_response()
}

pub async fn delete_token(State(st): State<AppState>, Path(token): Path<String>) -> Response {
    match st.registry.delete(&token).await {
        Ok(()) => Json(json!({ "status": "success" })).into_response(),
        Err(e) => registry_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct RemarkBody {
    #[serde(default)]
    remark: String,
}

pub async fn update_remark(
    State(st): State<AppState>,
    Path(token): Path<String>,
    body: Bytes,
) -> Response {
    let body: RemarkBody = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match st.registry.update_remark(&token, &body.remark).await {
        Ok(()) => Json(json!({ "status": "success" })).into_response(),
        Err(e) => registry_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct CoolBody {
    seconds: u64,
}

pub async fn cool_token(
    State(st): State<AppState>,
    Path(token): Path<String>,
    body: Bytes,
) -> Response {
    let body: CoolBody = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if body.seconds == 0 {
        return json_error(StatusCode::BAD_REQUEST, "seconds must be positive");
    }
    if let Err(e) = st.registry.get(&token).await {
        return registry_error(e);
    }

    match st.pool.set_cooldown(&token, Duration::from_secs(body.seconds)).await {
        Ok(cool) => Json(json!({
            "status": "success",
            "token": mask_token(&token),
            "cool_end": cool.cool_end,
        }))
        .into_response(),
        Err(e) => registry_error(RegistryError::Store(e)),
    }
}

pub async fn check_tokens(State(st): State<AppState>) -> Response {
    match st.prober.probe_all().await {
        Ok(summary) => Json(json!({
            "status": "success",
            "total": summary.total,
            "updated": summary.updated,
            "disabled": summary.disabled,
        }))
        .into_response(),
        Err(e) => {
            if let ProbeError::Store(err) = &e {
                tracing::error!(error = %err, "credential probe sweep failed");
            }
            json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
