pub mod auth;
pub mod handler;
pub mod middleware;
pub mod pipeline;
pub mod streaming;
pub mod tls;

use axum::{Router as AxumRouter, middleware as axum_mw};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use tollgate_core::config::SettingsHolder;
use tollgate_core::keys::GeneratedKey;
use tollgate_core::metrics::Metrics;
use tollgate_core::model::{ApiKey, User, UserStatus};
use tollgate_core::quota::QuotaGate;
use tollgate_core::rate_limit::RateLimiter;
use tollgate_core::store::Store;
use tollgate_core::usage::UsageRecorder;
use tollgate_proxy::router::Router;
use tollgate_proxy::transport::UpstreamPool;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub settings: Arc<SettingsHolder>,
    pub router: Arc<Router>,
    pub upstreams: Arc<UpstreamPool>,
    pub validator: Arc<auth::KeyValidator>,
    pub rate_limiter: Arc<RateLimiter>,
    pub quota: Arc<QuotaGate>,
    pub recorder: Arc<UsageRecorder>,
    pub metrics: Arc<Metrics>,
    pub start_time: Instant,
}

impl AppState {
    /// Rebuild the route snapshot from the store. A build failure keeps
    /// the previous snapshot serving and is returned to the caller.
    pub async fn reload_routes(&self) -> anyhow::Result<()> {
        let routes = self.store.list_routes().await?;
        let upstreams = self.store.list_upstreams().await?;
        let live_ids: Vec<String> = upstreams.iter().map(|u| u.id.clone()).collect();
        self.router.rebuild(routes, upstreams)?;
        self.upstreams.retain_ids(&live_ids);
        Ok(())
    }

    /// Re-read the settings namespace and propagate it to the limiter and
    /// validation cache. Key/quota caches start cold afterwards.
    pub async fn reload_settings(&self) -> anyhow::Result<()> {
        let settings = self.settings.reload_from(&*self.store).await?;
        self.rate_limiter.update_config(settings.rate_limit_config());
        self.validator.reconfigure(&settings);
        self.quota.clear();
        Ok(())
    }

    /// Issue a new API key for `user_id`. The raw key is returned exactly
    /// once; only prefix and hash are stored.
    pub async fn issue_key(&self, user_id: &str, name: &str) -> anyhow::Result<GeneratedKey> {
        let settings = self.settings.load();
        // Ensure the owner exists before minting.
        let _user: User = self.store.get_user(user_id).await?;
        let generated =
            tollgate_core::keys::generate(&settings.key_scheme, settings.bcrypt_cost)?;
        self.store
            .create_key(ApiKey {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: user_id.to_string(),
                prefix: generated.prefix.clone(),
                key_hash: generated.hash.clone(),
                name: name.to_string(),
                expires_at: None,
                revoked_at: None,
                created_at: chrono::Utc::now(),
            })
            .await?;
        Ok(generated)
    }

    /// Revoke a key and purge any cached positive validation for it.
    pub async fn revoke_key(&self, key_id: &str) -> anyhow::Result<()> {
        let mut key = self.store.get_key(key_id).await?;
        key.revoked_at = Some(chrono::Utc::now());
        self.store.update_key(key).await?;
        self.validator.invalidate_key(key_id);
        Ok(())
    }

    /// Suspend or reactivate a user, invalidating cached identities.
    pub async fn set_user_status(&self, user_id: &str, status: UserStatus) -> anyhow::Result<()> {
        let mut user = self.store.get_user(user_id).await?;
        user.status = status;
        self.store.update_user(user).await?;
        self.validator.invalidate_user(user_id);
        self.quota.invalidate(user_id);
        Ok(())
    }
}

/// Assemble the axum router: built-in handlers behind the gateway
/// pipeline, which serves priority routes first and falls through here
/// only when no dynamic route matches.
pub fn build_router(state: AppState) -> AxumRouter {
    let body_limit_bytes = state.settings.load().body_limit_mb * 1024 * 1024;

    // Public built-ins — no auth required
    let public_routes = AxumRouter::new()
        .route("/health", axum::routing::get(handler::health::health))
        .route("/metrics", axum::routing::get(handler::health::metrics));

    // Admin session bootstrap — no auth required (login endpoint)
    let session_routes = AxumRouter::new().route(
        "/admin/session",
        axum::routing::post(handler::session::login),
    );

    // Admin surface — session token required
    let admin_routes = AxumRouter::new()
        .route(
            "/admin/usage/summary",
            axum::routing::get(handler::admin::usage_summary),
        )
        .route(
            "/admin/usage/recent",
            axum::routing::get(handler::admin::usage_recent),
        )
        .route(
            "/admin/users/{id}/usage",
            axum::routing::get(handler::admin::user_usage),
        )
        .route(
            "/admin/keys",
            axum::routing::get(handler::admin::list_keys).post(handler::admin::create_key),
        )
        .route(
            "/admin/keys/{id}",
            axum::routing::delete(handler::admin::revoke_key),
        )
        .route(
            "/admin/reload",
            axum::routing::post(handler::admin::reload),
        )
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            handler::session::require_session,
        ));

    // Compose built-ins, then wrap with the gateway layers (outer → inner:
    // trace, request context, usage log, pipeline, body limit, built-ins).
    AxumRouter::new()
        .merge(public_routes)
        .merge(session_routes)
        .merge(admin_routes)
        .fallback(handler::health::not_found)
        .layer(RequestBodyLimitLayer::new(body_limit_bytes))
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            pipeline::gateway_middleware,
        ))
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::usage_log::usage_log_middleware,
        ))
        .layer(axum_mw::from_fn(
            middleware::request_context::request_context_middleware,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
