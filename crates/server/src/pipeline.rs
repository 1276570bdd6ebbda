//! The request pipeline: priority-route matching ahead of the built-in
//! handlers, then auth → rate limit → quota → transform → proxy.
//!
//! Terminal errors short-circuit with the JSON error body and still leave
//! a [`UsageMeta`] on the response, so invalid-key attempts and admission
//! denials are accounted like everything else. Panics below this point
//! are caught here and surfaced as `internal` with the correlation id.

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use crate::AppState;
use crate::auth;
use crate::middleware::usage_log::UsageMeta;
use crate::streaming;
use tollgate_core::config::RuntimeSettings;
use tollgate_core::context::RequestContext;
use tollgate_core::error::GatewayError;
use tollgate_core::meter::MeterStats;
use tollgate_core::model::{Identity, Protocol, UsageEvent};
use tollgate_core::quota::QuotaDecision;
use tollgate_core::rate_limit::Admission;
use tollgate_core::store::UsageStore;
use tollgate_core::usage::DeferredUsage;
use tollgate_proxy::router::{CompiledRoute, RouteMatch};
use tollgate_proxy::transform;
use tollgate_proxy::transport::{self, OutboundRequest};
use tollgate_proxy::websocket;

/// Outermost gateway stage. Priority routes are consulted before the
/// built-in handlers; only unmatched requests fall through to `next`.
pub async fn gateway_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let matched = {
        let snapshot = state.router.snapshot();
        snapshot.match_route(request.method().as_str(), request.uri().path())
    };
    let Some(matched) = matched else {
        return next.run(request).await;
    };

    let ctx = request
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_else(|| RequestContext::new(None));
    state.metrics.record_request(&matched.route.route.id);

    let outcome = AssertUnwindSafe(serve_route(state.clone(), matched.clone(), ctx.clone(), request))
        .catch_unwind()
        .await;

    match outcome {
        Ok(response) => response,
        Err(_) => {
            tracing::error!(
                request_id = %ctx.request_id,
                route_id = %matched.route.route.id,
                "panic in request pipeline"
            );
            state.metrics.record_error("internal");
            let error = GatewayError::Internal("unexpected panic in request pipeline".into());
            let code = error.code();
            let mut response = error.into_response();
            response.extensions_mut().insert(meta_for_error(&matched, None, code));
            response
        }
    }
}

/// A short-circuited pipeline stage: the error, plus whatever identity
/// and admission data had been resolved so the denial can be accounted
/// and decorated with rate-limit headers.
struct Terminal {
    error: GatewayError,
    identity: Option<Identity>,
    admission: Option<Admission>,
}

async fn serve_route(
    state: AppState,
    matched: RouteMatch,
    ctx: RequestContext,
    request: Request,
) -> Response {
    match run_stages(&state, &matched, &ctx, request).await {
        Ok(response) => response,
        Err(terminal) => {
            state.metrics.record_error(terminal.error.code());
            let code = terminal.error.code();
            let mut response = terminal.error.into_response();
            if let Some(admission) = &terminal.admission {
                set_rate_limit_headers(response.headers_mut(), admission);
            }
            response
                .extensions_mut()
                .insert(meta_for_error(&matched, terminal.identity.as_ref(), code));
            response
        }
    }
}

fn meta_for_error(matched: &RouteMatch, identity: Option<&Identity>, code: &str) -> UsageMeta {
    UsageMeta {
        route_id: matched.route.route.id.clone(),
        user_id: identity.map(|i| i.user.id.clone()).unwrap_or_default(),
        key_id: identity.map(|i| i.key.id.clone()).unwrap_or_default(),
        method: String::new(),
        path: String::new(),
        bytes_in: 0,
        bytes_out: 0,
        compute_units: 0.0,
        error: Some(code.to_string()),
        deferred: false,
    }
}

async fn run_stages(
    state: &AppState,
    matched: &RouteMatch,
    ctx: &RequestContext,
    request: Request,
) -> Result<Response, Terminal> {
    let settings = state.settings.load();

    // ── Auth ──
    let raw_key = auth::extract_key(request.headers(), &settings.auth_header)
        .map(str::to_owned)
        .ok_or(Terminal {
            error: GatewayError::MissingApiKey,
            identity: None,
            admission: None,
        })?;
    let identity = state
        .validator
        .validate(&*state.store, &raw_key, &settings, Utc::now())
        .await
        .map_err(|error| Terminal {
            error,
            identity: None,
            admission: None,
        })?;

    // ── Rate limit ──
    let admission = state.rate_limiter.admit(
        &identity.user.id,
        identity.plan.rate_limit_per_minute,
        std::time::Instant::now(),
    );
    if !admission.allowed {
        return Err(Terminal {
            error: GatewayError::RateLimitExceeded {
                retry_after_secs: admission.retry_after_secs,
            },
            identity: Some(identity),
            admission: Some(admission),
        });
    }

    // ── Quota ──
    let usage_store: &dyn UsageStore = &*state.store;
    match state
        .quota
        .check(
            usage_store,
            &identity.user.id,
            identity.plan.requests_per_month,
            Utc::now(),
        )
        .await
    {
        Ok(QuotaDecision::Allowed) => {}
        Ok(QuotaDecision::Exceeded { retry_after_secs }) => {
            return Err(Terminal {
                error: GatewayError::QuotaExceeded { retry_after_secs },
                identity: Some(identity),
                admission: Some(admission),
            });
        }
        Err(e) => {
            return Err(Terminal {
                error: e.into(),
                identity: Some(identity),
                admission: Some(admission),
            });
        }
    }

    // ── Transform + proxy ──
    dispatch(state, matched, ctx, &identity, admission, &settings, request)
        .await
        .map_err(|error| Terminal {
            error,
            identity: Some(identity),
            admission: Some(admission),
        })
}

async fn dispatch(
    state: &AppState,
    matched: &RouteMatch,
    ctx: &RequestContext,
    identity: &Identity,
    admission: Admission,
    settings: &RuntimeSettings,
    request: Request,
) -> Result<Response, GatewayError> {
    let compiled: &Arc<CompiledRoute> = &matched.route;
    let route = &compiled.route;

    let client_method = request.method().to_string();
    let client_path = request.uri().path().to_string();

    let vars = transform::transform_vars(&matched.params, identity);
    let (mut parts, body) = request.into_parts();
    let path_and_query =
        transform::target_path(route, &vars, parts.uri.path(), parts.uri.query());
    let method = transform::outbound_method(route, &parts.method);
    let headers =
        transform::outbound_headers(&parts.headers, route, identity, &settings.auth_header);

    // ── WebSocket: upgrade both sides and bridge ──
    if route.protocol == Protocol::Websocket {
        let upgrade = WebSocketUpgrade::from_request_parts(&mut parts, &())
            .await
            .map_err(|e| {
                GatewayError::Internal(format!("websocket route requires an upgrade request: {e}"))
            })?;

        let url = transport::websocket_url(&compiled.upstream.base_url, &path_and_query)?;
        // The upstream handshake supplies its own Sec-WebSocket-* set.
        let mut ws_headers = HeaderMap::new();
        for (name, value) in &headers {
            if !name.as_str().starts_with("sec-websocket-") {
                ws_headers.append(name.clone(), value.clone());
            }
        }

        let event = event_template(ctx, identity, route, &client_method, &client_path, 101, 0);
        let guard = DeferredUsage::new(
            Arc::clone(&state.recorder),
            Arc::clone(&state.metrics),
            compiled.meter.clone(),
            event,
            ctx.started,
        );

        // Quota is spent only once the upstream accepts the handshake;
        // the bridge awaits this after its connect succeeds.
        let quota = Arc::clone(&state.quota);
        let quota_user = identity.user.id.clone();
        let on_connected = async move {
            quota.advance(&quota_user, Utc::now()).await;
        };

        let mut response = upgrade.on_upgrade(move |socket| {
            websocket::bridge(socket, url, ws_headers, guard, on_connected)
        });
        set_rate_limit_headers(response.headers_mut(), &admission);
        response.extensions_mut().insert(UsageMeta {
            route_id: route.id.clone(),
            user_id: identity.user.id.clone(),
            key_id: identity.key.id.clone(),
            method: client_method,
            path: client_path,
            bytes_in: 0,
            bytes_out: 0,
            compute_units: 0.0,
            error: None,
            deferred: true,
        });
        return Ok(response);
    }

    // ── Read (and possibly template) the request body ──
    let body_bytes = axum::body::to_bytes(body, settings.body_limit_mb * 1024 * 1024)
        .await
        .map_err(|e| GatewayError::Internal(format!("failed to read request body: {e}")))?;
    let bytes_in = body_bytes.len() as u64;

    let out_body = match transform::render_body(route, &vars) {
        Some(rendered) => Some(Bytes::from(rendered)),
        None if body_bytes.is_empty() => None,
        None => Some(body_bytes),
    };

    let client = state.upstreams.client_for(&compiled.upstream)?;
    let outbound = OutboundRequest {
        method,
        url: transport::upstream_url(&compiled.upstream.base_url, &path_and_query),
        headers,
        body: out_body,
    };

    let transform_ref = route.response_transform.as_ref();
    match route.protocol {
        Protocol::Http => {
            let total = Duration::from_secs(compiled.upstream.timeout_secs.max(1));
            let upstream_response =
                transport::send_with_retry(&client, outbound, Some(total)).await?;
            state.quota.advance(&identity.user.id, Utc::now()).await;

            let upstream_status = upstream_response.status().as_u16();
            let upstream_headers = upstream_response.headers().clone();
            let upstream_body = transport::read_body_capped(
                upstream_response,
                settings.buffer_cap_mb * 1024 * 1024,
            )
            .await?;

            let status = transform::map_status(upstream_status, transform_ref);
            let final_body: Bytes = transform_ref
                .and_then(|t| t.body_replace.clone())
                .map(Bytes::from)
                .unwrap_or(upstream_body);
            let bytes_out = final_body.len() as u64;

            let mut response = Response::builder()
                .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY))
                .body(Body::from(final_body))
                .map_err(|e| GatewayError::Internal(format!("response build failed: {e}")))?;
            *response.headers_mut() = transform::inbound_headers(&upstream_headers, transform_ref);
            set_rate_limit_headers(response.headers_mut(), &admission);

            let stats = MeterStats {
                bytes_in,
                bytes_out,
                latency_ms: ctx.elapsed_ms(),
            };
            response.extensions_mut().insert(UsageMeta {
                route_id: route.id.clone(),
                user_id: identity.user.id.clone(),
                key_id: identity.key.id.clone(),
                method: client_method,
                path: client_path,
                bytes_in,
                bytes_out,
                compute_units: compiled.meter.eval(&stats),
                error: None,
                deferred: false,
            });
            Ok(response)
        }
        Protocol::HttpStream | Protocol::Sse => {
            // No total timeout: the read timeout bounds idle intervals.
            let upstream_response = transport::send_with_retry(&client, outbound, None).await?;
            state.quota.advance(&identity.user.id, Utc::now()).await;

            let upstream_status = upstream_response.status().as_u16();
            let upstream_headers = upstream_response.headers().clone();
            let status = transform::map_status(upstream_status, transform_ref);

            let event = event_template(
                ctx,
                identity,
                route,
                &client_method,
                &client_path,
                status,
                bytes_in,
            );
            let guard = DeferredUsage::new(
                Arc::clone(&state.recorder),
                Arc::clone(&state.metrics),
                compiled.meter.clone(),
                event,
                ctx.started,
            );

            let mut response = Response::builder()
                .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY))
                .body(streaming::passthrough_body(upstream_response, guard))
                .map_err(|e| GatewayError::Internal(format!("response build failed: {e}")))?;
            *response.headers_mut() = transform::inbound_headers(&upstream_headers, transform_ref);
            set_rate_limit_headers(response.headers_mut(), &admission);

            response.extensions_mut().insert(UsageMeta {
                route_id: route.id.clone(),
                user_id: identity.user.id.clone(),
                key_id: identity.key.id.clone(),
                method: client_method,
                path: client_path,
                bytes_in,
                bytes_out: 0,
                compute_units: 0.0,
                error: None,
                deferred: true,
            });
            Ok(response)
        }
        Protocol::Websocket => unreachable!("handled above"),
    }
}

fn event_template(
    ctx: &RequestContext,
    identity: &Identity,
    route: &tollgate_core::model::Route,
    method: &str,
    path: &str,
    status: u16,
    bytes_in: u64,
) -> UsageEvent {
    UsageEvent {
        ts: ctx.received_at,
        user_id: identity.user.id.clone(),
        key_id: identity.key.id.clone(),
        route_id: route.id.clone(),
        method: method.to_string(),
        path: path.to_string(),
        status,
        latency_ms: 0,
        bytes_in,
        bytes_out: 0,
        compute_units: 0.0,
        error: None,
    }
}

fn set_rate_limit_headers(headers: &mut HeaderMap, admission: &Admission) {
    headers.insert(
        "x-ratelimit-remaining",
        HeaderValue::from(admission.remaining),
    );
    headers.insert("x-ratelimit-reset", HeaderValue::from(admission.reset_secs));
}
