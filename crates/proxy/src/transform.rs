//! Declarative request/response rewriting.
//!
//! Transforms are pure functions of (route, path params, identity): no
//! clock or randomness flows in, so replaying the same request yields the
//! same outbound bytes. Identity headers are always injected; hop-by-hop
//! headers are stripped in both directions.

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use std::collections::HashMap;

use tollgate_core::model::{Identity, ResponseTransform, Route};

/// Connection-scoped headers that must never cross the proxy.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Variables available to path rewrites and body templates: path params
/// plus the identity fields.
pub fn transform_vars(
    params: &HashMap<String, String>,
    identity: &Identity,
) -> HashMap<String, String> {
    let mut vars = params.clone();
    vars.insert("user_id".to_string(), identity.user.id.clone());
    vars.insert("key_id".to_string(), identity.key.id.clone());
    vars.insert("plan_id".to_string(), identity.plan.id.clone());
    vars
}

/// Replace `{name}` placeholders from `vars`. Unknown placeholders render
/// empty; a `{` without a closing brace is passed through verbatim.
pub fn substitute(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        match rest[open..].find('}') {
            Some(close) => {
                let name = &rest[open + 1..open + close];
                if let Some(value) = vars.get(name) {
                    out.push_str(value);
                }
                rest = &rest[open + close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// The outbound request path: the route's rewrite pattern (with params
/// substituted) or the original path, with the query string carried over.
pub fn target_path(
    route: &Route,
    vars: &HashMap<String, String>,
    original_path: &str,
    original_query: Option<&str>,
) -> String {
    let path = match &route.path_rewrite {
        Some(rewrite) => substitute(rewrite, vars),
        None => original_path.to_string(),
    };
    match original_query {
        Some(query) if !query.is_empty() => format!("{path}?{query}"),
        _ => path,
    }
}

/// The outbound method, honouring the route's override.
pub fn outbound_method(route: &Route, original: &Method) -> Method {
    route
        .method_override
        .as_deref()
        .and_then(|m| m.to_uppercase().parse().ok())
        .unwrap_or_else(|| original.clone())
}

/// Assemble the headers forwarded to the upstream: client headers minus
/// hop-by-hop and credential headers, route transform set/unset, then the
/// identity and entitlement headers (which always win).
pub fn outbound_headers(
    original: &HeaderMap,
    route: &Route,
    identity: &Identity,
    auth_header: &str,
) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, value) in original {
        let name_str = name.as_str();
        if is_hop_by_hop(name_str)
            || name_str.eq_ignore_ascii_case(auth_header)
            || name_str.eq_ignore_ascii_case("authorization")
            || name_str.eq_ignore_ascii_case("host")
            || name_str.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Some(transform) = &route.request_transform {
        for name in &transform.remove_headers {
            if let Ok(name) = name.parse::<HeaderName>() {
                headers.remove(&name);
            }
        }
        for (name, value) in &transform.set_headers {
            if let (Ok(name), Ok(value)) =
                (name.parse::<HeaderName>(), value.parse::<HeaderValue>())
            {
                headers.insert(name, value);
            }
        }
    }

    set_str(&mut headers, "x-user-id", &identity.user.id);
    set_str(&mut headers, "x-plan-id", &identity.plan.id);
    set_str(&mut headers, "x-key-id", &identity.key.id);

    for entitlement in &identity.plan.entitlements {
        if let Some(header) = &entitlement.header {
            if let (Ok(name), Ok(value)) = (
                header.parse::<HeaderName>(),
                entitlement.value.parse::<HeaderValue>(),
            ) {
                headers.insert(name, value);
            }
        }
    }

    headers
}

/// Render the replacement request body, when the route defines one.
pub fn render_body(route: &Route, vars: &HashMap<String, String>) -> Option<String> {
    route
        .request_transform
        .as_ref()
        .and_then(|t| t.body_template.as_ref())
        .map(|template| substitute(template, vars))
}

/// Copy upstream response headers toward the client, applying the
/// route's response transform.
pub fn inbound_headers(
    upstream: &HeaderMap,
    transform: Option<&ResponseTransform>,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream {
        if is_hop_by_hop(name.as_str()) || name.as_str().eq_ignore_ascii_case("content-length") {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Some(transform) = transform {
        for name in &transform.remove_headers {
            if let Ok(name) = name.parse::<HeaderName>() {
                headers.remove(&name);
            }
        }
        for (name, value) in &transform.set_headers {
            if let (Ok(name), Ok(value)) =
                (name.parse::<HeaderName>(), value.parse::<HeaderValue>())
            {
                headers.insert(name, value);
            }
        }
    }

    headers
}

/// Remap the upstream status per the route's response transform.
pub fn map_status(status: u16, transform: Option<&ResponseTransform>) -> u16 {
    transform
        .and_then(|t| t.status_map.iter().find(|m| m.from == status))
        .map(|m| m.to)
        .unwrap_or(status)
}

fn set_str(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = value.parse::<HeaderValue>() {
        headers.insert(HeaderName::from_static(name), value);
    }
}
