use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::state::AppState;

#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_inflight: AtomicU64,
    pub status_2xx: AtomicU64,
    pub status_4xx: AtomicU64,
    pub status_5xx: AtomicU64,
    pub admissions_granted: AtomicU64,
    pub admissions_no_credential: AtomicU64,
    pub admissions_exhausted: AtomicU64,
    pub upstream_errors: AtomicU64,
    pub stream_events: AtomicU64,
}

pub fn render_metrics(st: &AppState) -> String {
    let m = &st.metrics;
    let mut body = String::new();

    body.push_str(&format!(
        "# HELP shardgate_requests_total Total requests handled.\n\
         # TYPE shardgate_requests_total counter\n\
         shardgate_requests_total {}\n",
        m.requests_total.load(Ordering::Relaxed),
    ));
    body.push_str(&format!(
        "# HELP shardgate_requests_inflight Currently in-flight requests.\n\
         # TYPE shardgate_requests_inflight gauge\n\
         shardgate_requests_inflight {}\n",
        m.requests_inflight.load(Ordering::Relaxed),
    ));
    body.push_str(&format!(
        "# HELP shardgate_responses_2xx Total 2xx responses.\n\
         # TYPE shardgate_responses_2xx counter\n\
         shardgate_responses_2xx {}\n",
        m.status_2xx.load(Ordering::Relaxed),
    ));
    body.push_str(&format!(
        "# HELP shardgate_responses_4xx Total 4xx responses.\n\
         # TYPE shardgate_responses_4xx counter\n\
         shardgate_responses_4xx {}\n",
        m.status_4xx.load(Ordering::Relaxed),
    ));
    body.push_str(&format!(
        "# HELP shardgate_responses_5xx Total 5xx responses.\n\
         # TYPE shardgate_responses_5xx counter\n\
         shardgate_responses_5xx {}\n",
        m.status_5xx.load(Ordering::Relaxed),
    ));
    body.push_str(&format!(
        "# HELP shardgate_admissions_granted Completion requests admitted onto a credential.\n\
         # TYPE shardgate_admissions_granted counter\n\
         shardgate_admissions_granted {}\n",
        m.admissions_granted.load(Ordering::Relaxed),
    ));
    body.push_str(&format!(
        "# HELP shardgate_admissions_no_credential Completion requests rejected on an empty pool.\n\
         # TYPE shardgate_admissions_no_credential counter\n\
         shardgate_admissions_no_credential {}\n",
        m.admissions_no_credential.load(Ordering::Relaxed),
    ));
    body.push_str(&format!(
        "# HELP shardgate_admissions_exhausted Completion requests with no eligible credential.\n\
         # TYPE shardgate_admissions_exhausted counter\n\
         shardgate_admissions_exhausted {}\n",
        m.admissions_exhausted.load(Ordering::Relaxed),
    ));
    body.push_str(&format!(
        "# HELP shardgate_upstream_errors Upstream dispatches that failed or returned non-200.\n\
         # TYPE shardgate_upstream_errors counter\n\
         shardgate_upstream_errors {}\n",
        m.upstream_errors.load(Ordering::Relaxed),
    ));
    body.push_str(&format!(
        "# HELP shardgate_stream_events SSE events sent to clients.\n\
         # TYPE shardgate_stream_events counter\n\
         shardgate_stream_events {}\n",
        m.stream_events.load(Ordering::Relaxed),
    ));
    body.push_str(&format!(
        "# HELP shardgate_selections_total Credentials handed out by the scheduler.\n\
         # TYPE shardgate_selections_total counter\n\
         shardgate_selections_total {}\n",
        st.pool.selections_total(),
    ));
    body.push_str(&format!(
        "# HELP shardgate_cooling_fallback_total Selections served from the cooling tier.\n\
         # TYPE shardgate_cooling_fallback_total counter\n\
         shardgate_cooling_fallback_total {}\n",
        st.pool.cooling_fallback_total(),
    ));
    body.push_str(&format!(
        "# HELP shardgate_credentials_disabled_total Credentials disabled by health probes.\n\
         # TYPE shardgate_credentials_disabled_total counter\n\
         shardgate_credentials_disabled_total {}\n",
        st.prober.disabled_total(),
    ));

    body
}

pub async fn metrics_handler(State(st): State<AppState>) -> impl IntoResponse {
    let body = render_metrics(&st);
    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

pub async fn track_requests(
    State(st): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible> {
    st.metrics.requests_inflight.fetch_add(1, Ordering::Relaxed);
    let resp = next.run(req).await;
    st.metrics.requests_inflight.fetch_sub(1, Ordering::Relaxed);
    st.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let status = resp.status().as_u16();
    if status >= 500 {
        st.metrics.status_5xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 400 {
        st.metrics.status_4xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 200 {
        st.metrics.status_2xx.fetch_add(1, Ordering::Relaxed);
    }

    Ok(resp)
}
