use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::store::StoreError;

/// Unified error type for the request pipeline.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("no API key was provided")]
    MissingApiKey,

    #[error("the API key is malformed or unknown")]
    InvalidApiKey,

    #[error("the API key has been revoked")]
    KeyRevoked,

    #[error("the API key has expired")]
    KeyExpired,

    #[error("the account is suspended")]
    UserSuspended,

    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("monthly request quota exceeded")]
    QuotaExceeded { retry_after_secs: u64 },

    #[error("no route matched the request")]
    RouteNotFound,

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream timed out: {0}")]
    UpstreamTimeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingApiKey
            | Self::InvalidApiKey
            | Self::KeyRevoked
            | Self::KeyExpired
            | Self::UserSuspended => StatusCode::UNAUTHORIZED,
            Self::RateLimitExceeded { .. } | Self::QuotaExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Self::RouteNotFound => StatusCode::NOT_FOUND,
            Self::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code, also recorded on usage events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingApiKey => "missing_api_key",
            Self::InvalidApiKey => "invalid_api_key",
            Self::KeyRevoked => "key_revoked",
            Self::KeyExpired => "key_expired",
            Self::UserSuspended => "user_suspended",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::RouteNotFound => "route_not_found",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::UpstreamTimeout(_) => "upstream_timeout",
            Self::Internal(_) => "internal",
        }
    }

    fn title(&self) -> &'static str {
        match self {
            Self::MissingApiKey => "Missing API key",
            Self::InvalidApiKey => "Invalid API key",
            Self::KeyRevoked => "Key revoked",
            Self::KeyExpired => "Key expired",
            Self::UserSuspended => "User suspended",
            Self::RateLimitExceeded { .. } => "Rate limit exceeded",
            Self::QuotaExceeded { .. } => "Quota exceeded",
            Self::RouteNotFound => "Route not found",
            Self::UpstreamUnavailable(_) => "Upstream unavailable",
            Self::UpstreamTimeout(_) => "Upstream timeout",
            Self::Internal(_) => "Internal error",
        }
    }

    /// Seconds the caller should wait before retrying, for admission errors.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimitExceeded { retry_after_secs }
            | Self::QuotaExceeded { retry_after_secs } => Some((*retry_after_secs).max(1)),
            _ => None,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "errors": [{
                "code": self.code(),
                "title": self.title(),
                "detail": self.to_string(),
            }]
        });

        let mut response = (
            status,
            [("content-type", "application/json")],
            body.to_string(),
        )
            .into_response();

        if let Some(secs) = self.retry_after_secs()
            && let Ok(value) = secs.to_string().parse()
        {
            response.headers_mut().insert("retry-after", value);
        }

        response
    }
}

impl From<StoreError> for GatewayError {
    fn from(e: StoreError) -> Self {
        Self::Internal(format!("store failure: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(GatewayError::MissingApiKey.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(GatewayError::KeyExpired.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            GatewayError::RateLimitExceeded { retry_after_secs: 3 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(GatewayError::RouteNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            GatewayError::UpstreamUnavailable("refused".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::UpstreamTimeout("read".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(GatewayError::MissingApiKey.code(), "missing_api_key");
        assert_eq!(GatewayError::InvalidApiKey.code(), "invalid_api_key");
        assert_eq!(GatewayError::KeyRevoked.code(), "key_revoked");
        assert_eq!(GatewayError::UserSuspended.code(), "user_suspended");
        assert_eq!(
            GatewayError::QuotaExceeded { retry_after_secs: 60 }.code(),
            "quota_exceeded"
        );
        assert_eq!(GatewayError::Internal("x".into()).code(), "internal");
    }

    #[test]
    fn test_retry_after_floor() {
        let e = GatewayError::RateLimitExceeded { retry_after_secs: 0 };
        assert_eq!(e.retry_after_secs(), Some(1));
        assert_eq!(GatewayError::RouteNotFound.retry_after_secs(), None);
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let response = GatewayError::QuotaExceeded { retry_after_secs: 120 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("retry-after").unwrap(), "120");

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["errors"][0]["code"], "quota_exceeded");
        assert!(value["errors"][0]["title"].is_string());
    }
}
