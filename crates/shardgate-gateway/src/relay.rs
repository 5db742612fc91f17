use std::convert::Infallible;
use std::sync::atomic::Ordering;

use axum::http::StatusCode;
use axum::response::{sse::Event, IntoResponse, Response};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use shardgate_common::{auth::json_error, upstream, Credential};
use tokio::sync::mpsc;

use crate::metrics::Metrics;
use crate::openai::{ChatCompletionChunk, ChunkChoice, Delta};
use crate::translate::UpstreamRequest;

pub type EventSender = mpsc::Sender<Result<Event, Infallible>>;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("upstream unreachable: {0}")]
    Unreachable(reqwest::Error),
    #[error("upstream error: {body}")]
    Status { status: u16, body: String },
    #[error("upstream read failed: {0}")]
    Read(reqwest::Error),
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::Status { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            RelayError::Unreachable(_) | RelayError::Read(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        json_error(self.status_code(), self.to_string())
    }
}

/// Sends the translated request on the credential's shard. Anything but a
/// 200 is turned into [`RelayError::Status`] carrying the upstream body.
pub async fn dispatch(
    http: &reqwest::Client,
    credential: &Credential,
    body: &UpstreamRequest,
) -> Result<reqwest::Response, RelayError> {
    let resp = upstream::chat_stream_request(http, &credential.tenant_url, &credential.token)
        .json(body)
        .send()
        .await
        .map_err(RelayError::Unreachable)?;

    let status = resp.status();
    tracing::debug!(
        token = %credential.masked_token(),
        status = status.as_u16(),
        "upstream responded"
    );
    if status != reqwest::StatusCode::OK {
        let body = resp.text().await.unwrap_or_default();
        return Err(RelayError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(resp)
}

/// One line of the upstream NDJSON stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UpstreamChunk {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub done: bool,
}

/// Splits a byte stream into NDJSON lines. Bytes are kept until a newline
/// arrives, so a line or a UTF-8 sequence may straddle two reads.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<UpstreamChunk> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(chunk) = parse_line(&line) {
                out.push(chunk);
            }
        }
        out
    }

    /// A last line the upstream did not terminate.
    pub fn finish(&mut self) -> Option<UpstreamChunk> {
        let line = std::mem::take(&mut self.buf);
        parse_line(&line)
    }
}

fn parse_line(line: &[u8]) -> Option<UpstreamChunk> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(chunk) => Some(chunk),
        Err(e) => {
            tracing::debug!(error = %e, "skipping malformed upstream line");
            None
        }
    }
}

/// Reads a whole upstream response and returns the concatenated text.
pub async fn collect(resp: reqwest::Response) -> Result<String, RelayError> {
    let mut stream = resp.bytes_stream();
    let mut decoder = LineDecoder::default();
    let mut text = String::new();

    while let Some(item) = stream.next().await {
        let bytes = item.map_err(RelayError::Read)?;
        for chunk in decoder.push(&bytes) {
            text.push_str(&chunk.text);
            if chunk.done {
                return Ok(text);
            }
        }
    }
    if let Some(chunk) = decoder.finish() {
        text.push_str(&chunk.text);
    }
    Ok(text)
}

/// Shapes outbound `chat.completion.chunk` objects for one response.
#[derive(Debug, Clone)]
pub struct ChunkTranscoder {
    id: String,
    created: i64,
    model: String,
}

impl ChunkTranscoder {
    pub fn new(model: &str) -> Self {
        let created = chrono::Utc::now().timestamp();
        Self {
            id: format!("chatcmpl-{created}"),
            created,
            model: model.to_string(),
        }
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<&'static str>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    pub fn delta(&self, text: &str) -> ChatCompletionChunk {
        self.chunk(
            Delta {
                role: Some("assistant"),
                content: Some(text.to_string()),
            },
            None,
        )
    }

    pub fn finish(&self) -> ChatCompletionChunk {
        self.chunk(Delta::default(), Some("stop"))
    }
}

fn data_event<T: Serialize>(value: &T) -> Event {
    Event::default().data(serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Completed,
    ClientGone,
    ReadFailed,
}

/// Re-emits each upstream line as an SSE event as soon as it is decoded.
///
/// Ends with a stop chunk and `[DONE]` once the upstream says done or
/// closes cleanly. A read error sends one error event and no `[DONE]`.
/// If the client goes away the upstream body is dropped unread.
pub async fn relay_stream<S, E>(
    body: S,
    transcoder: ChunkTranscoder,
    tx: EventSender,
    metrics: &Metrics,
) -> StreamEnd
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut stream = std::pin::pin!(body);
    let mut decoder = LineDecoder::default();

    let send = |event: Event| {
        let tx = tx.clone();
        async move {
            let ok = tx.send(Ok(event)).await.is_ok();
            if ok {
                metrics.stream_events.fetch_add(1, Ordering::Relaxed);
            }
            ok
        }
    };

    loop {
        let item = tokio::select! {
            item = stream.next() => item,
            _ = tx.closed() => return StreamEnd::ClientGone,
        };

        let bytes = match item {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "upstream stream read failed");
                let _ = send(data_event(&serde_json::json!({
                    "error": format!("upstream read failed: {e}")
                })))
                .await;
                return StreamEnd::ReadFailed;
            }
            None => break,
        };

        for chunk in decoder.push(&bytes) {
            if !chunk.text.is_empty() && !send(data_event(&transcoder.delta(&chunk.text))).await {
                return StreamEnd::ClientGone;
            }
            if chunk.done {
                return finish_stream(&transcoder, send).await;
            }
        }
    }

    if let Some(chunk) = decoder.finish() {
        if !chunk.text.is_empty() && !send(data_event(&transcoder.delta(&chunk.text))).await {
            return StreamEnd::ClientGone;
        }
    }
    finish_stream(&transcoder, send).await
}

async fn finish_stream<F, Fut>(transcoder: &ChunkTranscoder, send: F) -> StreamEnd
where
    F: Fn(Event) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    if !send(data_event(&transcoder.finish())).await {
        return StreamEnd::ClientGone;
    }
    if !send(Event::default().data("[DONE]")).await {
        return StreamEnd::ClientGone;
    }
    StreamEnd::Completed
}
