//! Request logging + usage recording.
//!
//! The pipeline stores a [`UsageMeta`] in the response extensions; this
//! middleware turns it into a usage event once the response is ready.
//! Streamed responses set `deferred` and account for themselves when the
//! body finishes (see `streaming`); requests served by built-in handlers
//! carry no meta and are only logged.

use axum::{extract::Request, extract::State, middleware::Next, response::Response};

use crate::AppState;
use tollgate_core::context::RequestContext;
use tollgate_core::model::UsageEvent;

/// Accounting data attached to responses by the gateway pipeline.
#[derive(Debug, Clone)]
pub struct UsageMeta {
    pub route_id: String,
    /// Empty when no identity was resolved (e.g. invalid key).
    pub user_id: String,
    pub key_id: String,
    pub method: String,
    pub path: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub compute_units: f64,
    pub error: Option<String>,
    /// True when a streaming guard will emit the event instead.
    pub deferred: bool,
}

pub async fn usage_log_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let ctx = request.extensions().get::<RequestContext>().cloned();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;
    let status = response.status().as_u16();

    let Some(ctx) = ctx else {
        return response;
    };
    let latency_ms = ctx.elapsed_ms();

    tracing::info!(
        request_id = %ctx.request_id,
        client_ip = ctx.client_ip.as_deref().unwrap_or("-"),
        method = %method,
        path = %path,
        status,
        latency_ms,
        "request completed"
    );

    if let Some(meta) = response.extensions().get::<UsageMeta>()
        && !meta.deferred
    {
        state.metrics.record_bytes(meta.bytes_in, meta.bytes_out);
        state.metrics.record_latency_ms(latency_ms);
        // Denied requests carry empty method/path in their meta; fall
        // back to what this middleware observed.
        let event_method = if meta.method.is_empty() {
            method.to_string()
        } else {
            meta.method.clone()
        };
        let event_path = if meta.path.is_empty() {
            path.clone()
        } else {
            meta.path.clone()
        };
        state.recorder.record(UsageEvent {
            ts: ctx.received_at,
            user_id: meta.user_id.clone(),
            key_id: meta.key_id.clone(),
            route_id: meta.route_id.clone(),
            method: event_method,
            path: event_path,
            status,
            latency_ms,
            bytes_in: meta.bytes_in,
            bytes_out: meta.bytes_out,
            compute_units: meta.compute_units,
            error: meta.error.clone(),
        });
    }

    response
}
