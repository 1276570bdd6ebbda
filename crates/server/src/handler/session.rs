//! Admin sessions: bcrypt-checked login issuing a short-lived JWT, and
//! the guard middleware for the admin surface.

use axum::Json;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::AppState;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    pub iat: usize,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// POST /admin/session
pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> impl IntoResponse {
    let settings = state.settings.load();

    let (Some(email), Some(password_hash)) =
        (&settings.admin_email, &settings.admin_password_hash)
    else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "not_configured", "message": "Admin sessions are not configured"})),
        );
    };

    if &body.email != email || !bcrypt::verify(&body.password, password_hash).unwrap_or(false) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid_credentials", "message": "Invalid email or password"})),
        );
    }

    let Some(secret) = settings.admin_jwt_secret.as_deref() else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "config_error", "message": "JWT secret not configured"})),
        );
    };

    match generate_token(&body.email, secret, settings.admin_jwt_ttl_secs) {
        Ok(token) => (
            StatusCode::OK,
            Json(json!({
                "token": token,
                "expires_in": settings.admin_jwt_ttl_secs,
                "token_type": "Bearer",
            })),
        ),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "token_error", "message": "Failed to generate token"})),
        ),
    }
}

/// Session-token guard for the admin routes.
pub async fn require_session(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    let settings = state.settings.load();
    let secret = settings.admin_jwt_secret.as_deref().ok_or_else(|| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "jwt_not_configured",
            "Admin JWT secret not configured",
        )
    })?;

    let token = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
        .ok_or_else(|| {
            error_response(
                StatusCode::UNAUTHORIZED,
                "missing_token",
                "Authorization header required",
            )
        })?;

    let key = DecodingKey::from_secret(secret.as_bytes());
    let token_data = decode::<Claims>(&token, &key, &Validation::default()).map_err(|e| {
        let (code, message) = match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                ("token_expired", "Token has expired")
            }
            _ => ("invalid_token", "Invalid token"),
        };
        error_response(StatusCode::UNAUTHORIZED, code, message)
    })?;

    let mut request = request;
    request.extensions_mut().insert(token_data.claims);
    Ok(next.run(request).await)
}

pub fn generate_token(
    subject: &str,
    secret: &str,
    ttl_secs: u64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = chrono::Utc::now().timestamp() as usize;
    let claims = Claims {
        sub: subject.to_string(),
        iat: now,
        exp: now + ttl_secs as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        [("content-type", "application/json")],
        json!({"error": code, "message": message}).to_string(),
    )
        .into_response()
}
