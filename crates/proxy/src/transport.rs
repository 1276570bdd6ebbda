//! Upstream HTTP transport: per-upstream clients with pooled
//! connections, buffered and streaming sends, and the retry-once policy
//! for idempotent methods.

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use tollgate_core::error::GatewayError;
use tollgate_core::model::Upstream;

/// Ceiling for the jittered retry backoff.
const BACKOFF_CAP: Duration = Duration::from_millis(500);

/// Build the HTTP client for one upstream.
///
/// No total timeout is set on the client: buffered sends attach the
/// upstream's timeout per request, while streaming protocols rely on the
/// read timeout so the clock only runs between chunks, not across the
/// whole transfer.
pub fn build_client(upstream: &Upstream) -> Result<reqwest::Client, anyhow::Error> {
    let mut builder = reqwest::Client::builder()
        .user_agent(concat!("tollgate/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(upstream.connect_timeout_secs.max(1)))
        .read_timeout(Duration::from_secs(upstream.timeout_secs.max(1)))
        .pool_max_idle_per_host(upstream.pool_max_idle);

    if let Some(proxy) = &upstream.proxy_url {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    } else {
        builder = builder.no_proxy();
    }

    Ok(builder.build()?)
}

/// Clients keyed by upstream id, rebuilt lazily after snapshot reloads.
pub struct UpstreamPool {
    clients: RwLock<HashMap<String, reqwest::Client>>,
}

impl UpstreamPool {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn client_for(&self, upstream: &Upstream) -> Result<reqwest::Client, GatewayError> {
        // Fast path: read lock
        {
            let clients = self.clients.read().unwrap();
            if let Some(client) = clients.get(&upstream.id) {
                return Ok(client.clone());
            }
        }
        // Slow path: build and insert
        let client = build_client(upstream)
            .map_err(|e| GatewayError::Internal(format!("upstream client build failed: {e}")))?;
        let mut clients = self.clients.write().unwrap();
        Ok(clients
            .entry(upstream.id.clone())
            .or_insert(client)
            .clone())
    }

    /// Drop clients for upstreams that no longer exist (snapshot reload).
    /// Surviving ids keep their idle connection pools warm.
    pub fn retain_ids(&self, live: &[String]) {
        let mut clients = self.clients.write().unwrap();
        clients.retain(|id, _| live.iter().any(|l| l == id));
    }
}

impl Default for UpstreamPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A fully transformed request ready to send upstream.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// GET/HEAD/OPTIONS may be replayed after a connection-class failure.
pub fn is_idempotent(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD || *method == Method::OPTIONS
}

fn classify(e: &reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::UpstreamTimeout(e.to_string())
    } else {
        GatewayError::UpstreamUnavailable(e.to_string())
    }
}

/// Retry triggers: connection-class errors and 502/503 statuses.
fn retryable_error(e: &GatewayError) -> bool {
    matches!(e, GatewayError::UpstreamUnavailable(_))
}

fn retryable_status(status: u16) -> bool {
    status == 502 || status == 503
}

async fn send_once(
    client: &reqwest::Client,
    request: &OutboundRequest,
    total_timeout: Option<Duration>,
) -> Result<reqwest::Response, GatewayError> {
    let mut builder = client
        .request(request.method.clone(), &request.url)
        .headers(request.headers.clone());
    if let Some(timeout) = total_timeout {
        builder = builder.timeout(timeout);
    }
    if let Some(body) = &request.body {
        builder = builder.body(body.clone());
    }
    builder.send().await.map_err(|e| classify(&e))
}

/// Send with at most one retry for idempotent methods, using a jittered
/// backoff capped at 500 ms.
pub async fn send_with_retry(
    client: &reqwest::Client,
    request: OutboundRequest,
    total_timeout: Option<Duration>,
) -> Result<reqwest::Response, GatewayError> {
    let may_retry = is_idempotent(&request.method);

    match send_once(client, &request, total_timeout).await {
        Ok(response) if may_retry && retryable_status(response.status().as_u16()) => {
            tracing::debug!(url = %request.url, status = response.status().as_u16(),
                "retrying idempotent request after upstream error status");
            tokio::time::sleep(backoff()).await;
            send_once(client, &request, total_timeout).await
        }
        Ok(response) => Ok(response),
        Err(e) if may_retry && retryable_error(&e) => {
            tracing::debug!(url = %request.url, error = %e,
                "retrying idempotent request after connection failure");
            tokio::time::sleep(backoff()).await;
            send_once(client, &request, total_timeout).await
        }
        Err(e) => Err(e),
    }
}

fn backoff() -> Duration {
    let jitter = Duration::from_millis((rand::random::<f64>() * 400.0) as u64);
    (Duration::from_millis(100) + jitter).min(BACKOFF_CAP)
}

/// Read a buffered response body, failing once it exceeds `cap` bytes.
/// Oversized bodies belong on streaming routes.
pub async fn read_body_capped(
    response: reqwest::Response,
    cap: usize,
) -> Result<Bytes, GatewayError> {
    let mut collected = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| classify(&e))?;
        if collected.len() + chunk.len() > cap {
            return Err(GatewayError::Internal(format!(
                "buffered upstream response exceeded the {cap}-byte cap"
            )));
        }
        collected.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(collected))
}

/// Join an upstream base URL with the outbound path-and-query.
pub fn upstream_url(base_url: &str, path_and_query: &str) -> String {
    let base = base_url.trim_end_matches('/');
    format!("{base}{path_and_query}")
}

/// Derive the WebSocket URL for an upstream (`http` → `ws`, `https` → `wss`).
pub fn websocket_url(base_url: &str, path_and_query: &str) -> Result<String, GatewayError> {
    let joined = upstream_url(base_url, path_and_query);
    if let Some(rest) = joined.strip_prefix("https://") {
        Ok(format!("wss://{rest}"))
    } else if let Some(rest) = joined.strip_prefix("http://") {
        Ok(format!("ws://{rest}"))
    } else if joined.starts_with("ws://") || joined.starts_with("wss://") {
        Ok(joined)
    } else {
        Err(GatewayError::UpstreamUnavailable(format!(
            "unsupported upstream scheme in {base_url}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(base: &str) -> Upstream {
        Upstream {
            id: "up1".to_string(),
            name: String::new(),
            base_url: base.to_string(),
            timeout_secs: 5,
            connect_timeout_secs: 2,
            pool_max_idle: 4,
            proxy_url: None,
            enabled: true,
        }
    }

    #[test]
    fn test_idempotent_methods() {
        assert!(is_idempotent(&Method::GET));
        assert!(is_idempotent(&Method::HEAD));
        assert!(is_idempotent(&Method::OPTIONS));
        assert!(!is_idempotent(&Method::POST));
        assert!(!is_idempotent(&Method::DELETE));
    }

    #[test]
    fn test_retry_triggers() {
        assert!(retryable_status(502));
        assert!(retryable_status(503));
        assert!(!retryable_status(500));
        assert!(!retryable_status(429));

        assert!(retryable_error(&GatewayError::UpstreamUnavailable(
            "refused".into()
        )));
        assert!(!retryable_error(&GatewayError::UpstreamTimeout(
            "read".into()
        )));
    }

    #[test]
    fn test_backoff_is_capped() {
        for _ in 0..50 {
            assert!(backoff() <= BACKOFF_CAP);
        }
    }

    #[test]
    fn test_url_joining() {
        assert_eq!(
            upstream_url("http://10.0.0.1:9000/", "/api/data?x=1"),
            "http://10.0.0.1:9000/api/data?x=1"
        );
        assert_eq!(
            upstream_url("http://10.0.0.1:9000", "/api/data"),
            "http://10.0.0.1:9000/api/data"
        );
    }

    #[test]
    fn test_websocket_url_schemes() {
        assert_eq!(
            websocket_url("http://host:1234", "/feed").unwrap(),
            "ws://host:1234/feed"
        );
        assert_eq!(
            websocket_url("https://host", "/feed").unwrap(),
            "wss://host/feed"
        );
        assert!(websocket_url("ftp://host", "/feed").is_err());
    }

    #[test]
    fn test_client_pool_reuses_and_retains() {
        let pool = UpstreamPool::new();
        let up = upstream("http://127.0.0.1:9000");
        pool.client_for(&up).unwrap();
        pool.client_for(&up).unwrap();
        assert_eq!(pool.clients.read().unwrap().len(), 1);

        pool.retain_ids(&["other".to_string()]);
        assert!(pool.clients.read().unwrap().is_empty());
    }

    #[test]
    fn test_bad_proxy_url_is_an_error() {
        let mut up = upstream("http://127.0.0.1:9000");
        up.proxy_url = Some("::not-a-url::".to_string());
        assert!(build_client(&up).is_err());
    }
}
