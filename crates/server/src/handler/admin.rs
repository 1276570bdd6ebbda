//! Read-mostly admin surface: usage roll-ups, key issuance/revocation,
//! and the snapshot reload hook. All endpoints sit behind the session
//! guard.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;

use crate::AppState;
use tollgate_core::model::period_for;
use tollgate_core::store::StoreError;

fn store_error(e: &StoreError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match e {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Conflict(_) | StoreError::Constraint(_) => StatusCode::CONFLICT,
        StoreError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({"error": "store_error", "message": e.to_string()})),
    )
}

#[derive(Deserialize)]
pub struct SummaryQuery {
    pub period: Option<String>,
}

/// GET /admin/usage/summary?period=YYYY-MM
pub async fn usage_summary(
    State(state): State<AppState>,
    Query(query): Query<SummaryQuery>,
) -> impl IntoResponse {
    let period = query
        .period
        .unwrap_or_else(|| period_for(chrono::Utc::now()));
    match state.store.summary(&period).await {
        Ok(rows) => (
            StatusCode::OK,
            Json(json!({"period": period, "users": rows})),
        ),
        Err(e) => store_error(&e),
    }
}

#[derive(Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
}

/// GET /admin/usage/recent?limit=N
pub async fn usage_recent(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(50).clamp(1, 1000);
    match state.store.recent_events(limit).await {
        Ok(events) => (StatusCode::OK, Json(json!({"events": events}))),
        Err(e) => store_error(&e),
    }
}

/// GET /admin/users/{id}/usage
pub async fn user_usage(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    match state.store.history(&user_id, 12).await {
        Ok(rows) => (StatusCode::OK, Json(json!({"user_id": user_id, "periods": rows}))),
        Err(e) => store_error(&e),
    }
}

#[derive(Deserialize)]
pub struct ListKeysQuery {
    pub user_id: String,
}

/// GET /admin/keys?user_id=…
pub async fn list_keys(
    State(state): State<AppState>,
    Query(query): Query<ListKeysQuery>,
) -> impl IntoResponse {
    match state.store.list_keys_by_user(&query.user_id).await {
        Ok(keys) => {
            let now = chrono::Utc::now();
            let rows: Vec<serde_json::Value> = keys
                .iter()
                .map(|k| {
                    json!({
                        "id": k.id,
                        "prefix": k.prefix,
                        "name": k.name,
                        "active": k.is_active(now),
                        "created_at": k.created_at,
                        "expires_at": k.expires_at,
                        "revoked_at": k.revoked_at,
                    })
                })
                .collect();
            (StatusCode::OK, Json(json!({"keys": rows})))
        }
        Err(e) => store_error(&e),
    }
}

#[derive(Deserialize)]
pub struct CreateKeyRequest {
    pub user_id: String,
    #[serde(default)]
    pub name: String,
}

/// POST /admin/keys — the raw key appears in this response and nowhere
/// else.
pub async fn create_key(
    State(state): State<AppState>,
    Json(body): Json<CreateKeyRequest>,
) -> impl IntoResponse {
    match state.issue_key(&body.user_id, &body.name).await {
        Ok(generated) => (
            StatusCode::CREATED,
            Json(json!({
                "key": generated.raw,
                "prefix": generated.prefix,
                "name": body.name,
            })),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "key_creation_failed", "message": e.to_string()})),
        ),
    }
}

/// DELETE /admin/keys/{id} — revokes (never hard-deletes) and purges the
/// validation cache.
pub async fn revoke_key(
    State(state): State<AppState>,
    Path(key_id): Path<String>,
) -> impl IntoResponse {
    match state.revoke_key(&key_id).await {
        Ok(()) => (StatusCode::OK, Json(json!({"revoked": key_id}))),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "revoke_failed", "message": e.to_string()})),
        ),
    }
}

/// POST /admin/reload — re-read settings and rebuild the route snapshot.
/// A failed route build keeps the previous snapshot and reports the
/// error.
pub async fn reload(State(state): State<AppState>) -> impl IntoResponse {
    if let Err(e) = state.reload_settings().await {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "settings_reload_failed", "message": e.to_string()})),
        );
    }
    match state.reload_routes().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"reloaded": true, "routes_version": state.router.version()})),
        ),
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"error": "route_build_failed", "message": e.to_string()})),
        ),
    }
}
