use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::{sse::KeepAlive, IntoResponse, Response, Sse},
    Extension, Json,
};
use bytes::Bytes;
use futures_util::Stream;
use shardgate_common::auth::json_error;
use shardgate_common::Mode;
use shardgate_pool::AdmissionGuard;
use tokio_stream::wrappers::ReceiverStream;

use crate::admission::AdmissionSlot;
use crate::openai::{
    model_list, AssistantMessage, ChatCompletion, ChatCompletionRequest, Choice, Usage,
};
use crate::relay::{self, ChunkTranscoder, EventSender, StreamEnd};
use crate::state::AppState;
use crate::tokens::estimate_tokens;
use crate::translate::to_upstream;

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn models() -> impl IntoResponse {
    Json(model_list())
}

pub async fn chat_completions(
    State(st): State<AppState>,
    Extension(slot): Extension<AdmissionSlot>,
    body: Bytes,
) -> Response {
    let Some(guard) = slot.take() else {
        tracing::error!("completion reached the handler without an admitted credential");
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, "credential not admitted");
    };

    let req: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(error = %e, "malformed completion request");
            guard.release().await;
            return json_error(StatusCode::BAD_REQUEST, format!("invalid request body: {e}"));
        }
    };

    let mode = Mode::from_model(&req.model);
    let upstream = to_upstream(&req);
    let token = guard.credential().masked_token();
    tracing::info!(
        token = %token,
        model = %req.model,
        mode = ?mode,
        stream = req.stream,
        messages = req.messages.len(),
        temperature = ?req.temperature,
        max_tokens = ?req.max_tokens,
        "dispatching completion"
    );

    // Charged before the call, whatever the outcome.
    if let Err(e) = st.pool.usage().charge(&guard.credential().token, mode).await {
        tracing::warn!(token = %token, error = %e, "failed to charge usage");
    }

    let resp = match relay::dispatch(&st.http, guard.credential(), &upstream).await {
        Ok(r) => r,
        Err(e) => {
            st.metrics.upstream_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(token = %token, error = %e, "upstream dispatch failed");
            guard.release().await;
            return e.into_response();
        }
    };

    if req.stream {
        stream_completion(st, guard, resp, &req.model)
    } else {
        let prompt_tokens = upstream.prompt_tokens();
        let result = relay::collect(resp).await;
        guard.release().await;
        match result {
            Ok(text) => Json(completion(&req.model, text, prompt_tokens)).into_response(),
            Err(e) => {
                st.metrics.upstream_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(token = %token, error = %e, "upstream read failed");
                e.into_response()
            }
        }
    }
}

fn completion(model: &str, text: String, prompt_tokens: usize) -> ChatCompletion {
    let created = chrono::Utc::now().timestamp();
    let completion_tokens = estimate_tokens(&text);
    ChatCompletion {
        id: format!("chatcmpl-{created}"),
        object: "chat.completion",
        created,
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: AssistantMessage::new(text),
            finish_reason: Some("stop"),
        }],
        usage: Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        },
    }
}

/// The relay runs on its own task and owns the guard until it finishes.
fn stream_completion(
    st: AppState,
    guard: AdmissionGuard,
    resp: reqwest::Response,
    model: &str,
) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel(64);
    let transcoder = ChunkTranscoder::new(model);

    tokio::spawn(relay_and_release(st, guard, resp.bytes_stream(), transcoder, tx));

    Sse::new(ReceiverStream::new(rx))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keep-alive"))
        .into_response()
}

/// Relays the body, then releases the credential however the stream ended.
async fn relay_and_release<S, E>(
    st: AppState,
    guard: AdmissionGuard,
    body: S,
    transcoder: ChunkTranscoder,
    tx: EventSender,
) -> StreamEnd
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let end = relay::relay_stream(body, transcoder, tx, &st.metrics).await;
    let token = guard.credential().masked_token();
    match end {
        StreamEnd::Completed => tracing::debug!(token = %token, "stream completed"),
        StreamEnd::ClientGone => tracing::info!(token = %token, "client went away mid-stream"),
        StreamEnd::ReadFailed => {
            st.metrics.upstream_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
    guard.release().await;
    end
}
