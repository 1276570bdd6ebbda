//! Admin surface tests: session login, guarded endpoints, key issuance
//! and revocation through the HTTP API.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tower::ServiceExt;

use tollgate_core::config::{RuntimeSettings, SettingsHolder};
use tollgate_core::metrics::Metrics;
use tollgate_core::model::{MatchType, Plan, Protocol, Route, Upstream, User, UserStatus};
use tollgate_core::quota::QuotaGate;
use tollgate_core::rate_limit::RateLimiter;
use tollgate_core::store::{Store, UsageStore};
use tollgate_core::usage::{RecorderConfig, UsageFlusher, UsageRecorder};
use tollgate_proxy::router::Router;
use tollgate_proxy::transport::UpstreamPool;
use tollgate_server::auth::KeyValidator;
use tollgate_server::{AppState, build_router};
use tollgate_store::MemStore;

struct Harness {
    state: AppState,
    _recorder_shutdown: watch::Sender<bool>,
}

async fn spawn_upstream() -> String {
    let app = axum::Router::new().route(
        "/api/data",
        axum::routing::get(|| async { "upstream-data" }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn build_harness() -> Harness {
    let base_url = spawn_upstream().await;
    let store: Arc<dyn Store> = Arc::new(MemStore::new());

    store
        .create_plan(Plan {
            id: "plan1".to_string(),
            name: "Test".to_string(),
            rate_limit_per_minute: 60,
            requests_per_month: -1,
            price_monthly_cents: 0,
            price_overage_cents: 0,
            entitlements: vec![],
            enabled: true,
            is_default: true,
        })
        .await
        .unwrap();
    store
        .create_user(User {
            id: "u1".to_string(),
            email: "dev@example.com".to_string(),
            plan_id: "plan1".to_string(),
            status: UserStatus::Active,
            password_hash: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    store
        .create_upstream(Upstream {
            id: "up1".to_string(),
            name: "backend".to_string(),
            base_url,
            timeout_secs: 5,
            connect_timeout_secs: 2,
            pool_max_idle: 4,
            proxy_url: None,
            enabled: true,
        })
        .await
        .unwrap();
    store
        .create_route(Route {
            id: "r-api".to_string(),
            name: "api".to_string(),
            priority: 0,
            match_type: MatchType::Prefix,
            path_pattern: "/api/".to_string(),
            methods: vec![],
            upstream_id: "up1".to_string(),
            path_rewrite: None,
            method_override: None,
            protocol: Protocol::Http,
            request_transform: None,
            response_transform: None,
            metering: None,
            enabled: true,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    // Admin credentials in the settings store; low bcrypt cost for tests.
    let password_hash = bcrypt::hash("hunter2", 4).unwrap();
    for (key, value) in [
        ("admin.email", "ops@example.com"),
        ("admin.password_hash", password_hash.as_str()),
        ("admin.jwt_secret", "test-secret"),
        ("keys.bcrypt_cost", "4"),
    ] {
        store.set_setting(key, value, false).await.unwrap();
    }

    let settings_holder = Arc::new(SettingsHolder::new(RuntimeSettings::default()));
    settings_holder.reload_from(&*store).await.unwrap();
    let settings = settings_holder.load();

    let metrics = Arc::new(Metrics::new());
    let recorder_config = RecorderConfig {
        ring_capacity: 256,
        batch_size: 8,
        flush_interval: Duration::from_millis(25),
        shutdown_grace: Duration::from_secs(1),
    };
    let recorder = Arc::new(UsageRecorder::new(&recorder_config, Arc::clone(&metrics)));
    let (recorder_shutdown, recorder_rx) = watch::channel(false);
    let store_clone: Arc<dyn Store> = Arc::clone(&store);
    let usage_store: Arc<dyn UsageStore> = store_clone;
    UsageFlusher::new(Arc::clone(&recorder), usage_store, recorder_config).spawn(recorder_rx);

    let state = AppState {
        store,
        settings: settings_holder,
        router: Arc::new(Router::new()),
        upstreams: Arc::new(UpstreamPool::new()),
        validator: Arc::new(KeyValidator::new(&settings)),
        rate_limiter: Arc::new(RateLimiter::new(settings.rate_limit_config())),
        quota: Arc::new(QuotaGate::new()),
        recorder,
        metrics,
        start_time: Instant::now(),
    };
    state.reload_routes().await.unwrap();

    Harness {
        state,
        _recorder_shutdown: recorder_shutdown,
    }
}

async fn send(harness: &Harness, request: Request<Body>) -> (StatusCode, Value) {
    let router = build_router(harness.state.clone());
    let response = router.oneshot(request).await.expect("request failed");
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read body");
    let value = serde_json::from_slice(&body).unwrap_or(json!({}));
    (status, value)
}

async fn login(harness: &Harness) -> String {
    let request = Request::builder()
        .method("POST")
        .uri("/admin/session")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"email": "ops@example.com", "password": "hunter2"}).to_string(),
        ))
        .unwrap();
    let (status, body) = send(harness, request).await;
    assert_eq!(status, StatusCode::OK, "login failed: {body:?}");
    body["token"].as_str().expect("no token").to_string()
}

fn authed(method: &str, uri: &str, token: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json");
    match body {
        Some(value) => builder.body(Body::from(value.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

#[tokio::test]
async fn login_rejects_bad_credentials() {
    let harness = build_harness().await;
    let request = Request::builder()
        .method("POST")
        .uri("/admin/session")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"email": "ops@example.com", "password": "wrong"}).to_string(),
        ))
        .unwrap();
    let (status, body) = send(&harness, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "invalid_credentials");
}

#[tokio::test]
async fn admin_routes_require_a_token() {
    let harness = build_harness().await;
    let request = Request::builder()
        .method("GET")
        .uri("/admin/usage/recent")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&harness, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "missing_token");

    let request = Request::builder()
        .method("GET")
        .uri("/admin/usage/recent")
        .header("authorization", "Bearer not-a-jwt")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&harness, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "invalid_token");
}

#[tokio::test]
async fn issued_key_works_until_revoked() {
    let harness = build_harness().await;
    let token = login(&harness).await;

    // Mint a key over the API; the raw key appears exactly once.
    let (status, body) = send(
        &harness,
        authed(
            "POST",
            "/admin/keys",
            &token,
            Some(json!({"user_id": "u1", "name": "ci"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "create failed: {body:?}");
    let raw_key = body["key"].as_str().expect("no raw key").to_string();
    assert!(raw_key.starts_with("ak_"));

    // The key authenticates proxied traffic.
    let request = Request::builder()
        .method("GET")
        .uri("/api/data")
        .header("x-api-key", &raw_key)
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&harness, request).await;
    assert_eq!(status, StatusCode::OK);

    // Listing shows it as active.
    let (status, body) = send(
        &harness,
        authed("GET", "/admin/keys?user_id=u1", &token, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let key_id = body["keys"][0]["id"].as_str().unwrap().to_string();
    assert_eq!(body["keys"][0]["active"], json!(true));

    // Revoke and verify the proxy path rejects immediately.
    let (status, _) = send(
        &harness,
        authed("DELETE", &format!("/admin/keys/{key_id}"), &token, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let request = Request::builder()
        .method("GET")
        .uri("/api/data")
        .header("x-api-key", &raw_key)
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&harness, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["errors"][0]["code"], "key_revoked");
}

#[tokio::test]
async fn reload_endpoint_rebuilds_snapshots() {
    let harness = build_harness().await;
    let token = login(&harness).await;

    // A route added behind the API is not served until a reload.
    harness
        .state
        .store
        .create_route(Route {
            id: "r-extra".to_string(),
            name: "extra".to_string(),
            priority: 1,
            match_type: MatchType::Exact,
            path_pattern: "/extra".to_string(),
            methods: vec![],
            upstream_id: "up1".to_string(),
            path_rewrite: Some("/api/data".to_string()),
            method_override: None,
            protocol: Protocol::Http,
            request_transform: None,
            response_transform: None,
            metering: None,
            enabled: true,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let (status, body) = send(&harness, authed("POST", "/admin/reload", &token, None)).await;
    assert_eq!(status, StatusCode::OK, "reload failed: {body:?}");
    assert_eq!(body["reloaded"], json!(true));

    // The rewritten route now proxies to the upstream data endpoint.
    let (_, create_body) = send(
        &harness,
        authed(
            "POST",
            "/admin/keys",
            &token,
            Some(json!({"user_id": "u1", "name": "ci"})),
        ),
    )
    .await;
    let raw_key = create_body["key"].as_str().unwrap().to_string();

    let request = Request::builder()
        .method("GET")
        .uri("/extra")
        .header("x-api-key", &raw_key)
        .body(Body::empty())
        .unwrap();
    let router = build_router(harness.state.clone());
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"upstream-data");
}

#[tokio::test]
async fn usage_summary_reflects_flushed_traffic() {
    let harness = build_harness().await;
    let token = login(&harness).await;

    let (_, create_body) = send(
        &harness,
        authed(
            "POST",
            "/admin/keys",
            &token,
            Some(json!({"user_id": "u1", "name": "ci"})),
        ),
    )
    .await;
    let raw_key = create_body["key"].as_str().unwrap().to_string();

    let request = Request::builder()
        .method("GET")
        .uri("/api/data")
        .header("x-api-key", &raw_key)
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&harness, request).await;
    assert_eq!(status, StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(200)).await;

    let (status, body) = send(
        &harness,
        authed("GET", "/admin/usage/summary", &token, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let users = body["users"].as_array().expect("users array");
    assert!(
        users.iter().any(|row| row["user_id"] == "u1"),
        "expected u1 in summary: {body:?}"
    );

    let (status, body) = send(
        &harness,
        authed("GET", "/admin/users/u1/usage", &token, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!body["periods"].as_array().unwrap().is_empty());
}
