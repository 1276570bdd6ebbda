use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;

use crate::AppState;
use tollgate_core::error::GatewayError;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "routes_version": state.router.version(),
    }))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// Fallback when neither a priority route nor a built-in handler matched.
pub async fn not_found() -> impl IntoResponse {
    GatewayError::RouteNotFound
}
