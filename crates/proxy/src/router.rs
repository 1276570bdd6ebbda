//! Priority-ordered route matching with atomic hot swap.
//!
//! Each reload compiles the enabled routes into an immutable
//! [`RouteTable`] (exact map, ordered prefix list, compiled regex list)
//! and publishes it behind an `ArcSwap`. Readers load the snapshot with
//! acquire semantics and never observe a partial update; a build failure
//! (bad regex, dangling upstream, bad metering expression) leaves the
//! previous snapshot in place.

use arc_swap::ArcSwap;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tollgate_core::meter::MeterExpr;
use tollgate_core::model::{MatchType, Route, Upstream};

#[derive(Debug, thiserror::Error)]
pub enum RouterBuildError {
    #[error("route {route}: upstream {upstream} does not exist or is disabled")]
    DanglingUpstream { route: String, upstream: String },

    #[error("route {route}: invalid regex pattern: {source}")]
    InvalidRegex {
        route: String,
        #[source]
        source: Box<regex::Error>,
    },

    #[error("route {route}: invalid metering expression: {source}")]
    InvalidMeter {
        route: String,
        #[source]
        source: tollgate_core::meter::MeterError,
    },
}

/// A route resolved against its upstream with its metering expression
/// compiled. Shared between the table and in-flight requests.
#[derive(Debug)]
pub struct CompiledRoute {
    pub route: Route,
    pub upstream: Upstream,
    pub meter: MeterExpr,
}

/// Result of a successful match.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<CompiledRoute>,
    pub params: HashMap<String, String>,
}

#[derive(Debug)]
struct PrefixEntry {
    /// Pattern with any trailing `*` removed.
    base: String,
    /// `/*` patterns contribute the remainder as `suffix`.
    capture_suffix: bool,
    route: Arc<CompiledRoute>,
}

#[derive(Debug)]
struct RegexEntry {
    regex: Regex,
    route: Arc<CompiledRoute>,
}

/// One immutable compiled snapshot of the route table.
#[derive(Debug)]
pub struct RouteTable {
    exact: HashMap<String, Vec<Arc<CompiledRoute>>>,
    prefix: Vec<PrefixEntry>,
    regex: Vec<RegexEntry>,
    route_count: usize,
}

impl RouteTable {
    pub fn empty() -> Self {
        Self {
            exact: HashMap::new(),
            prefix: Vec::new(),
            regex: Vec::new(),
            route_count: 0,
        }
    }

    /// Compile a snapshot. `routes` may arrive in any order; ordering is
    /// re-established here. Disabled routes are skipped; enabled routes
    /// referencing a missing or disabled upstream fail the build.
    pub fn build(
        routes: Vec<Route>,
        upstreams: &HashMap<String, Upstream>,
    ) -> Result<Self, RouterBuildError> {
        let mut ordered: Vec<Route> = routes.into_iter().filter(|r| r.enabled).collect();
        // Priority desc, then longer pattern, then earlier creation.
        ordered.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(b.path_pattern.len().cmp(&a.path_pattern.len()))
                .then(a.created_at.cmp(&b.created_at))
        });

        let mut table = Self::empty();

        for route in ordered {
            let upstream = upstreams
                .get(&route.upstream_id)
                .filter(|u| u.enabled)
                .cloned()
                .ok_or_else(|| RouterBuildError::DanglingUpstream {
                    route: route.id.clone(),
                    upstream: route.upstream_id.clone(),
                })?;

            let meter = match &route.metering {
                Some(source) => MeterExpr::compile(source).map_err(|source| {
                    RouterBuildError::InvalidMeter {
                        route: route.id.clone(),
                        source,
                    }
                })?,
                None => MeterExpr::per_request(),
            };

            let pattern = route.path_pattern.clone();
            let match_type = route.match_type;
            let compiled = Arc::new(CompiledRoute {
                route,
                upstream,
                meter,
            });

            match match_type {
                MatchType::Exact if pattern.ends_with("/*") => {
                    // An exact pattern with a wildcard tail degrades to a
                    // suffix-capturing prefix.
                    table.prefix.push(PrefixEntry {
                        base: pattern[..pattern.len() - 1].to_string(),
                        capture_suffix: true,
                        route: compiled,
                    });
                }
                MatchType::Exact => {
                    table.exact.entry(pattern).or_default().push(compiled);
                }
                MatchType::Prefix => {
                    let (base, capture_suffix) = if let Some(stripped) = pattern.strip_suffix("/*")
                    {
                        (format!("{stripped}/"), true)
                    } else {
                        (pattern, false)
                    };
                    table.prefix.push(PrefixEntry {
                        base,
                        capture_suffix,
                        route: compiled,
                    });
                }
                MatchType::Regex => {
                    let regex =
                        Regex::new(&pattern).map_err(|e| RouterBuildError::InvalidRegex {
                            route: compiled.route.id.clone(),
                            source: Box::new(e),
                        })?;
                    table.regex.push(RegexEntry {
                        regex,
                        route: compiled,
                    });
                }
            }
            table.route_count += 1;
        }

        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.route_count
    }

    pub fn is_empty(&self) -> bool {
        self.route_count == 0
    }

    /// Match a request. The decision depends only on (method, path) and
    /// this snapshot.
    pub fn match_route(&self, method: &str, path: &str) -> Option<RouteMatch> {
        // Exact index first; candidates are already priority-ordered.
        if let Some(candidates) = self.exact.get(path) {
            for candidate in candidates {
                if method_allowed(&candidate.route, method) {
                    return Some(RouteMatch {
                        route: Arc::clone(candidate),
                        params: HashMap::new(),
                    });
                }
            }
        }

        // Prefix list: first hit wins (priority desc, longest first).
        for entry in &self.prefix {
            if !path.starts_with(entry.base.as_str()) {
                continue;
            }
            if !method_allowed(&entry.route.route, method) {
                continue;
            }
            let mut params = HashMap::new();
            if entry.capture_suffix {
                params.insert("suffix".to_string(), path[entry.base.len()..].to_string());
            }
            return Some(RouteMatch {
                route: Arc::clone(&entry.route),
                params,
            });
        }

        // Regex list, in priority order.
        for entry in &self.regex {
            if !method_allowed(&entry.route.route, method) {
                continue;
            }
            if let Some(captures) = entry.regex.captures(path) {
                let mut params = HashMap::new();
                for name in entry.regex.capture_names().flatten() {
                    if let Some(value) = captures.name(name) {
                        params.insert(name.to_string(), value.as_str().to_string());
                    }
                }
                return Some(RouteMatch {
                    route: Arc::clone(&entry.route),
                    params,
                });
            }
        }

        None
    }
}

fn method_allowed(route: &Route, method: &str) -> bool {
    route.methods.is_empty()
        || route
            .methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method))
}

/// Holder publishing [`RouteTable`] snapshots to the hot path.
pub struct Router {
    table: ArcSwap<RouteTable>,
    version: AtomicU64,
}

impl Router {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(RouteTable::empty()),
            version: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn snapshot(&self) -> Arc<RouteTable> {
        self.table.load_full()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Compile and publish a new snapshot. On failure the previous
    /// snapshot stays live and the error is returned to the caller.
    pub fn rebuild(
        &self,
        routes: Vec<Route>,
        upstreams: Vec<Upstream>,
    ) -> Result<(), RouterBuildError> {
        let by_id: HashMap<String, Upstream> =
            upstreams.into_iter().map(|u| (u.id.clone(), u)).collect();
        let table = RouteTable::build(routes, &by_id)?;
        let count = table.len();
        self.table.store(Arc::new(table));
        let version = self.version.fetch_add(1, Ordering::Release) + 1;
        tracing::info!(routes = count, version, "route table rebuilt");
        Ok(())
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use tollgate_core::model::Protocol;

    fn upstream(id: &str) -> Upstream {
        Upstream {
            id: id.to_string(),
            name: id.to_string(),
            base_url: format!("http://{id}.internal:8080"),
            timeout_secs: 30,
            connect_timeout_secs: 10,
            pool_max_idle: 8,
            proxy_url: None,
            enabled: true,
        }
    }

    fn route(id: &str, match_type: MatchType, pattern: &str) -> Route {
        Route {
            id: id.to_string(),
            name: id.to_string(),
            priority: 0,
            match_type,
            path_pattern: pattern.to_string(),
            methods: vec![],
            upstream_id: "up1".to_string(),
            path_rewrite: None,
            method_override: None,
            protocol: Protocol::Http,
            request_transform: None,
            response_transform: None,
            metering: None,
            enabled: true,
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn table(routes: Vec<Route>) -> RouteTable {
        let mut ups = HashMap::new();
        ups.insert("up1".to_string(), upstream("up1"));
        RouteTable::build(routes, &ups).unwrap()
    }

    #[test]
    fn test_exact_match_with_method_mask() {
        let mut get_only = route("r1", MatchType::Exact, "/api/data");
        get_only.methods = vec!["GET".to_string()];
        let t = table(vec![get_only]);

        assert!(t.match_route("GET", "/api/data").is_some());
        assert!(t.match_route("get", "/api/data").is_some());
        assert!(t.match_route("POST", "/api/data").is_none());
        assert!(t.match_route("GET", "/api/data/x").is_none());
    }

    #[test]
    fn test_prefix_match_and_suffix_capture() {
        let t = table(vec![
            route("plain", MatchType::Prefix, "/files/"),
            route("wild", MatchType::Prefix, "/blob/*"),
        ]);

        let plain = t.match_route("GET", "/files/a/b").unwrap();
        assert_eq!(plain.route.route.id, "plain");
        assert!(plain.params.is_empty());

        let wild = t.match_route("GET", "/blob/2026/report.pdf").unwrap();
        assert_eq!(wild.route.route.id, "wild");
        assert_eq!(wild.params["suffix"], "2026/report.pdf");
    }

    #[test]
    fn test_regex_named_captures() {
        let t = table(vec![route(
            "rx",
            MatchType::Regex,
            r"^/users/(?P<user>[a-z0-9]+)/items/(?P<item>\d+)$",
        )]);

        let m = t.match_route("GET", "/users/alice/items/42").unwrap();
        assert_eq!(m.params["user"], "alice");
        assert_eq!(m.params["item"], "42");
        assert!(t.match_route("GET", "/users/alice/items/x").is_none());
    }

    #[test]
    fn test_priority_beats_length_beats_age() {
        let mut low = route("low", MatchType::Prefix, "/api/long/specific/");
        low.priority = 1;
        let mut high = route("high", MatchType::Prefix, "/api/");
        high.priority = 10;
        let t = table(vec![low, high]);

        // Higher priority wins even with a shorter pattern.
        let m = t.match_route("GET", "/api/long/specific/x").unwrap();
        assert_eq!(m.route.route.id, "high");

        // Equal priority: longer pattern wins.
        let t = table(vec![
            route("short", MatchType::Prefix, "/api/"),
            route("long", MatchType::Prefix, "/api/v2/"),
        ]);
        assert_eq!(
            t.match_route("GET", "/api/v2/x").unwrap().route.route.id,
            "long"
        );

        // Equal priority and length: earlier creation wins.
        let older = route("older", MatchType::Prefix, "/api/");
        let mut newer = route("newer", MatchType::Prefix, "/api/");
        newer.created_at = older.created_at + Duration::hours(1);
        let t = table(vec![newer, older]);
        assert_eq!(
            t.match_route("GET", "/api/x").unwrap().route.route.id,
            "older"
        );
    }

    #[test]
    fn test_disabled_routes_are_skipped() {
        let mut disabled = route("off", MatchType::Exact, "/api/data");
        disabled.enabled = false;
        let t = table(vec![disabled]);
        assert!(t.match_route("GET", "/api/data").is_none());
    }

    #[test]
    fn test_dangling_upstream_rejects_build() {
        let mut bad = route("r1", MatchType::Exact, "/x");
        bad.upstream_id = "missing".to_string();
        let mut ups = HashMap::new();
        ups.insert("up1".to_string(), upstream("up1"));

        let err = RouteTable::build(vec![bad], &ups).unwrap_err();
        assert!(matches!(err, RouterBuildError::DanglingUpstream { .. }));
    }

    #[test]
    fn test_disabled_upstream_rejects_build() {
        let mut ups = HashMap::new();
        let mut off = upstream("up1");
        off.enabled = false;
        ups.insert("up1".to_string(), off);

        let err = RouteTable::build(vec![route("r1", MatchType::Exact, "/x")], &ups).unwrap_err();
        assert!(matches!(err, RouterBuildError::DanglingUpstream { .. }));
    }

    #[test]
    fn test_invalid_regex_rejects_build() {
        let mut ups = HashMap::new();
        ups.insert("up1".to_string(), upstream("up1"));
        let err =
            RouteTable::build(vec![route("rx", MatchType::Regex, "([")], &ups).unwrap_err();
        assert!(matches!(err, RouterBuildError::InvalidRegex { .. }));
    }

    #[test]
    fn test_invalid_meter_rejects_build() {
        let mut bad = route("r1", MatchType::Exact, "/x");
        bad.metering = Some("bytes_owt * 2".to_string());
        let mut ups = HashMap::new();
        ups.insert("up1".to_string(), upstream("up1"));
        assert!(matches!(
            RouteTable::build(vec![bad], &ups).unwrap_err(),
            RouterBuildError::InvalidMeter { .. }
        ));
    }

    #[test]
    fn test_failed_rebuild_keeps_previous_snapshot() {
        let router = Router::new();
        router
            .rebuild(
                vec![route("r1", MatchType::Exact, "/api/data")],
                vec![upstream("up1")],
            )
            .unwrap();
        assert_eq!(router.version(), 1);

        let mut dangling = route("r2", MatchType::Exact, "/other");
        dangling.upstream_id = "missing".to_string();
        assert!(router.rebuild(vec![dangling], vec![upstream("up1")]).is_err());

        // The old snapshot still serves.
        assert_eq!(router.version(), 1);
        assert!(router.snapshot().match_route("GET", "/api/data").is_some());
    }

    #[test]
    fn test_root_exact_route() {
        let t = table(vec![route("root", MatchType::Exact, "/")]);
        assert!(t.match_route("GET", "/").is_some());
        assert!(t.match_route("GET", "/other").is_none());
    }
}
