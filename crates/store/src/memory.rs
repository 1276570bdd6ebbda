//! In-memory store backend.
//!
//! Every namespace is a `RwLock`-ed map; raw usage events are kept in a
//! bounded deque so a long-running process does not grow without bound.
//! Route and upstream mutations bump a watch channel the snapshot
//! rebuilder subscribes to.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use tokio::sync::watch;

use tollgate_core::model::{
    ApiKey, Plan, Route, Upstream, UsageAggregate, UsageDelta, UsageEvent, User,
};
use tollgate_core::store::{
    KeyStore, PlanStore, RouteStore, SettingsStore, StoreError, TlsCacheStore, UpstreamStore,
    UserStore, UsageStore,
};

/// Raw events retained for the `recent` admin view.
const EVENT_RETENTION: usize = 100_000;

pub struct MemStore {
    users: RwLock<HashMap<String, User>>,
    keys: RwLock<HashMap<String, ApiKey>>,
    plans: RwLock<HashMap<String, Plan>>,
    routes: RwLock<HashMap<String, Route>>,
    upstreams: RwLock<HashMap<String, Upstream>>,
    events: RwLock<VecDeque<UsageEvent>>,
    aggregates: RwLock<HashMap<(String, String), UsageAggregate>>,
    tls_cache: RwLock<HashMap<String, Vec<u8>>>,
    settings: RwLock<HashMap<String, String>>,
    route_version: watch::Sender<u64>,
}

impl MemStore {
    pub fn new() -> Self {
        let (route_version, _) = watch::channel(0);
        Self {
            users: RwLock::new(HashMap::new()),
            keys: RwLock::new(HashMap::new()),
            plans: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            upstreams: RwLock::new(HashMap::new()),
            events: RwLock::new(VecDeque::new()),
            aggregates: RwLock::new(HashMap::new()),
            tls_cache: RwLock::new(HashMap::new()),
            settings: RwLock::new(HashMap::new()),
            route_version,
        }
    }

    fn bump_routes(&self) {
        self.route_version.send_modify(|v| *v += 1);
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserStore for MemStore {
    async fn create_user(&self, user: User) -> Result<(), StoreError> {
        let mut users = self.users.write().unwrap();
        if users.contains_key(&user.id) {
            return Err(StoreError::Conflict(format!("user {} exists", user.id)));
        }
        users.insert(user.id.clone(), user);
        Ok(())
    }

    async fn get_user(&self, id: &str) -> Result<User, StoreError> {
        self.users
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound("user"))
    }

    async fn get_user_by_email(&self, email: &str) -> Result<User, StoreError> {
        self.users
            .read()
            .unwrap()
            .values()
            .find(|u| u.email == email)
            .cloned()
            .ok_or(StoreError::NotFound("user"))
    }

    async fn update_user(&self, user: User) -> Result<(), StoreError> {
        let mut users = self.users.write().unwrap();
        if !users.contains_key(&user.id) {
            return Err(StoreError::NotFound("user"));
        }
        users.insert(user.id.clone(), user);
        Ok(())
    }

    async fn delete_user(&self, id: &str) -> Result<(), StoreError> {
        self.users
            .write()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or(StoreError::NotFound("user"))
    }

    async fn list_users(&self, limit: usize, offset: usize) -> Result<Vec<User>, StoreError> {
        let users = self.users.read().unwrap();
        let mut all: Vec<User> = users.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all.into_iter().skip(offset).take(limit).collect())
    }
}

#[async_trait]
impl KeyStore for MemStore {
    async fn create_key(&self, key: ApiKey) -> Result<(), StoreError> {
        let mut keys = self.keys.write().unwrap();
        if keys.contains_key(&key.id) {
            return Err(StoreError::Conflict(format!("key {} exists", key.id)));
        }
        keys.insert(key.id.clone(), key);
        Ok(())
    }

    async fn get_key(&self, id: &str) -> Result<ApiKey, StoreError> {
        self.keys
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound("key"))
    }

    async fn list_keys_by_prefix(&self, prefix: &str) -> Result<Vec<ApiKey>, StoreError> {
        Ok(self
            .keys
            .read()
            .unwrap()
            .values()
            .filter(|k| k.prefix == prefix)
            .cloned()
            .collect())
    }

    async fn list_keys_by_user(&self, user_id: &str) -> Result<Vec<ApiKey>, StoreError> {
        let mut keys: Vec<ApiKey> = self
            .keys
            .read()
            .unwrap()
            .values()
            .filter(|k| k.user_id == user_id)
            .cloned()
            .collect();
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(keys)
    }

    async fn update_key(&self, key: ApiKey) -> Result<(), StoreError> {
        let mut keys = self.keys.write().unwrap();
        if !keys.contains_key(&key.id) {
            return Err(StoreError::NotFound("key"));
        }
        keys.insert(key.id.clone(), key);
        Ok(())
    }

    async fn delete_key(&self, id: &str) -> Result<(), StoreError> {
        self.keys
            .write()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or(StoreError::NotFound("key"))
    }
}

#[async_trait]
impl PlanStore for MemStore {
    async fn create_plan(&self, plan: Plan) -> Result<(), StoreError> {
        let mut plans = self.plans.write().unwrap();
        if plans.contains_key(&plan.id) {
            return Err(StoreError::Conflict(format!("plan {} exists", plan.id)));
        }
        if plan.is_default && plans.values().any(|p| p.is_default) {
            return Err(StoreError::Constraint(
                "another plan already carries the default flag".into(),
            ));
        }
        plans.insert(plan.id.clone(), plan);
        Ok(())
    }

    async fn get_plan(&self, id: &str) -> Result<Plan, StoreError> {
        self.plans
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound("plan"))
    }

    async fn get_default_plan(&self) -> Result<Option<Plan>, StoreError> {
        Ok(self
            .plans
            .read()
            .unwrap()
            .values()
            .find(|p| p.is_default && p.enabled)
            .cloned())
    }

    async fn list_plans(&self) -> Result<Vec<Plan>, StoreError> {
        let mut plans: Vec<Plan> = self.plans.read().unwrap().values().cloned().collect();
        plans.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(plans)
    }

    async fn update_plan(&self, plan: Plan) -> Result<(), StoreError> {
        let mut plans = self.plans.write().unwrap();
        if !plans.contains_key(&plan.id) {
            return Err(StoreError::NotFound("plan"));
        }
        if plan.is_default
            && plans.values().any(|p| p.is_default && p.id != plan.id)
        {
            return Err(StoreError::Constraint(
                "another plan already carries the default flag".into(),
            ));
        }
        plans.insert(plan.id.clone(), plan);
        Ok(())
    }

    async fn delete_plan(&self, id: &str) -> Result<(), StoreError> {
        let referenced = self
            .users
            .read()
            .unwrap()
            .values()
            .any(|u| u.plan_id == id);
        if referenced {
            return Err(StoreError::Constraint(format!(
                "plan {id} is referenced by existing users"
            )));
        }
        self.plans
            .write()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or(StoreError::NotFound("plan"))
    }
}

#[async_trait]
impl RouteStore for MemStore {
    async fn create_route(&self, route: Route) -> Result<(), StoreError> {
        {
            let mut routes = self.routes.write().unwrap();
            if routes.contains_key(&route.id) {
                return Err(StoreError::Conflict(format!("route {} exists", route.id)));
            }
            routes.insert(route.id.clone(), route);
        }
        self.bump_routes();
        Ok(())
    }

    async fn get_route(&self, id: &str) -> Result<Route, StoreError> {
        self.routes
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound("route"))
    }

    async fn list_routes(&self) -> Result<Vec<Route>, StoreError> {
        let mut routes: Vec<Route> = self.routes.read().unwrap().values().cloned().collect();
        routes.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(routes)
    }

    async fn update_route(&self, route: Route) -> Result<(), StoreError> {
        {
            let mut routes = self.routes.write().unwrap();
            if !routes.contains_key(&route.id) {
                return Err(StoreError::NotFound("route"));
            }
            routes.insert(route.id.clone(), route);
        }
        self.bump_routes();
        Ok(())
    }

    async fn delete_route(&self, id: &str) -> Result<(), StoreError> {
        let removed = self.routes.write().unwrap().remove(id);
        match removed {
            Some(_) => {
                self.bump_routes();
                Ok(())
            }
            None => Err(StoreError::NotFound("route")),
        }
    }

    fn watch_routes(&self) -> watch::Receiver<u64> {
        self.route_version.subscribe()
    }
}

#[async_trait]
impl UpstreamStore for MemStore {
    async fn create_upstream(&self, upstream: Upstream) -> Result<(), StoreError> {
        {
            let mut upstreams = self.upstreams.write().unwrap();
            if upstreams.contains_key(&upstream.id) {
                return Err(StoreError::Conflict(format!(
                    "upstream {} exists",
                    upstream.id
                )));
            }
            upstreams.insert(upstream.id.clone(), upstream);
        }
        self.bump_routes();
        Ok(())
    }

    async fn get_upstream(&self, id: &str) -> Result<Upstream, StoreError> {
        self.upstreams
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound("upstream"))
    }

    async fn list_upstreams(&self) -> Result<Vec<Upstream>, StoreError> {
        let mut upstreams: Vec<Upstream> =
            self.upstreams.read().unwrap().values().cloned().collect();
        upstreams.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(upstreams)
    }

    async fn update_upstream(&self, upstream: Upstream) -> Result<(), StoreError> {
        {
            let mut upstreams = self.upstreams.write().unwrap();
            if !upstreams.contains_key(&upstream.id) {
                return Err(StoreError::NotFound("upstream"));
            }
            upstreams.insert(upstream.id.clone(), upstream);
        }
        self.bump_routes();
        Ok(())
    }

    async fn delete_upstream(&self, id: &str) -> Result<(), StoreError> {
        let referenced = self
            .routes
            .read()
            .unwrap()
            .values()
            .any(|r| r.upstream_id == id);
        if referenced {
            return Err(StoreError::Constraint(format!(
                "upstream {id} is referenced by existing routes"
            )));
        }
        let removed = self.upstreams.write().unwrap().remove(id);
        match removed {
            Some(_) => {
                self.bump_routes();
                Ok(())
            }
            None => Err(StoreError::NotFound("upstream")),
        }
    }
}

#[async_trait]
impl UsageStore for MemStore {
    async fn append_events(&self, events: &[UsageEvent]) -> Result<(), StoreError> {
        let mut stored = self.events.write().unwrap();
        for event in events {
            if stored.len() >= EVENT_RETENTION {
                stored.pop_front();
            }
            stored.push_back(event.clone());
        }
        Ok(())
    }

    async fn increment_aggregate(
        &self,
        user_id: &str,
        period: &str,
        delta: &UsageDelta,
    ) -> Result<(), StoreError> {
        let mut aggregates = self.aggregates.write().unwrap();
        let entry = aggregates
            .entry((user_id.to_string(), period.to_string()))
            .or_insert_with(|| UsageAggregate {
                user_id: user_id.to_string(),
                period: period.to_string(),
                ..UsageAggregate::default()
            });
        entry.requests += delta.requests;
        entry.compute_units += delta.compute_units;
        entry.bytes_in += delta.bytes_in;
        entry.bytes_out += delta.bytes_out;
        entry.errors += delta.errors;
        entry.latency_ms_total += delta.latency_ms_total;
        Ok(())
    }

    async fn get_aggregate(
        &self,
        user_id: &str,
        period: &str,
    ) -> Result<Option<UsageAggregate>, StoreError> {
        Ok(self
            .aggregates
            .read()
            .unwrap()
            .get(&(user_id.to_string(), period.to_string()))
            .cloned())
    }

    async fn summary(&self, period: &str) -> Result<Vec<UsageAggregate>, StoreError> {
        let mut rows: Vec<UsageAggregate> = self
            .aggregates
            .read()
            .unwrap()
            .values()
            .filter(|a| a.period == period)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.requests.cmp(&a.requests));
        Ok(rows)
    }

    async fn history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<UsageAggregate>, StoreError> {
        let mut rows: Vec<UsageAggregate> = self
            .aggregates
            .read()
            .unwrap()
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.period.cmp(&a.period));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<UsageEvent>, StoreError> {
        let events = self.events.read().unwrap();
        Ok(events.iter().rev().take(limit).cloned().collect())
    }
}

#[async_trait]
impl TlsCacheStore for MemStore {
    async fn tls_get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.tls_cache.read().unwrap().get(key).cloned())
    }

    async fn tls_put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.tls_cache.write().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn tls_delete(&self, key: &str) -> Result<(), StoreError> {
        self.tls_cache.write().unwrap().remove(key);
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for MemStore {
    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.settings.read().unwrap().get(key).cloned())
    }

    async fn set_setting(
        &self,
        key: &str,
        value: &str,
        _encrypted: bool,
    ) -> Result<(), StoreError> {
        self.settings
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn all_settings(&self) -> Result<HashMap<String, String>, StoreError> {
        Ok(self.settings.read().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use tollgate_core::model::UserStatus;

    fn user(id: &str, plan: &str) -> User {
        User {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            plan_id: plan.to_string(),
            status: UserStatus::Active,
            password_hash: None,
            created_at: Utc::now(),
        }
    }

    fn plan(id: &str, default: bool) -> Plan {
        Plan {
            id: id.to_string(),
            name: id.to_string(),
            rate_limit_per_minute: 60,
            requests_per_month: 1000,
            price_monthly_cents: 0,
            price_overage_cents: 0,
            entitlements: vec![],
            enabled: true,
            is_default: default,
        }
    }

    fn route(id: &str, upstream: &str, priority: i32) -> Route {
        Route {
            id: id.to_string(),
            name: id.to_string(),
            priority,
            match_type: tollgate_core::model::MatchType::Prefix,
            path_pattern: "/api/".to_string(),
            methods: vec![],
            upstream_id: upstream.to_string(),
            path_rewrite: None,
            method_override: None,
            protocol: tollgate_core::model::Protocol::Http,
            request_transform: None,
            response_transform: None,
            metering: None,
            enabled: true,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_user_crud_roundtrip() {
        let store = MemStore::new();
        store.create_user(user("u1", "free")).await.unwrap();

        assert!(store.create_user(user("u1", "free")).await.is_err());
        assert_eq!(store.get_user("u1").await.unwrap().plan_id, "free");
        assert_eq!(
            store
                .get_user_by_email("u1@example.com")
                .await
                .unwrap()
                .id,
            "u1"
        );

        let mut updated = user("u1", "pro");
        updated.status = UserStatus::Suspended;
        store.update_user(updated).await.unwrap();
        assert_eq!(
            store.get_user("u1").await.unwrap().status,
            UserStatus::Suspended
        );

        store.delete_user("u1").await.unwrap();
        assert!(store.get_user("u1").await.is_err());
    }

    #[tokio::test]
    async fn test_single_default_plan() {
        let store = MemStore::new();
        store.create_plan(plan("free", true)).await.unwrap();
        let err = store.create_plan(plan("pro", true)).await.unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));

        store.create_plan(plan("pro", false)).await.unwrap();
        assert_eq!(store.get_default_plan().await.unwrap().unwrap().id, "free");
    }

    #[tokio::test]
    async fn test_referenced_plan_cannot_be_deleted() {
        let store = MemStore::new();
        store.create_plan(plan("free", false)).await.unwrap();
        store.create_user(user("u1", "free")).await.unwrap();

        assert!(matches!(
            store.delete_plan("free").await.unwrap_err(),
            StoreError::Constraint(_)
        ));

        store.delete_user("u1").await.unwrap();
        store.delete_plan("free").await.unwrap();
    }

    #[tokio::test]
    async fn test_key_prefix_lookup() {
        let store = MemStore::new();
        let now = Utc::now();
        for (id, prefix) in [("k1", "ak_aaaaaaaaa"), ("k2", "ak_aaaaaaaaa"), ("k3", "ak_bbbbbbbbb")]
        {
            store
                .create_key(ApiKey {
                    id: id.to_string(),
                    user_id: "u1".to_string(),
                    prefix: prefix.to_string(),
                    key_hash: "h".to_string(),
                    name: String::new(),
                    expires_at: None,
                    revoked_at: None,
                    created_at: now,
                })
                .await
                .unwrap();
        }

        let hits = store.list_keys_by_prefix("ak_aaaaaaaaa").await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(store.list_keys_by_prefix("ak_zzzzzzzzz").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_route_ordering_and_watch() {
        let store = MemStore::new();
        let mut rx = store.watch_routes();
        assert_eq!(*rx.borrow(), 0);

        let mut early = route("older", "up1", 5);
        early.created_at = Utc::now() - Duration::hours(1);
        store.create_route(route("low", "up1", 1)).await.unwrap();
        store.create_route(route("high", "up1", 10)).await.unwrap();
        store.create_route(early).await.unwrap();
        store.create_route(route("tie", "up1", 5)).await.unwrap();

        let ordered: Vec<String> = store
            .list_routes()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ordered, vec!["high", "older", "tie", "low"]);

        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 4);
    }

    #[tokio::test]
    async fn test_referenced_upstream_cannot_be_deleted() {
        let store = MemStore::new();
        store
            .create_upstream(Upstream {
                id: "up1".to_string(),
                name: String::new(),
                base_url: "http://127.0.0.1:9000".to_string(),
                timeout_secs: 30,
                connect_timeout_secs: 10,
                pool_max_idle: 8,
                proxy_url: None,
                enabled: true,
            })
            .await
            .unwrap();
        store.create_route(route("r1", "up1", 0)).await.unwrap();

        assert!(matches!(
            store.delete_upstream("up1").await.unwrap_err(),
            StoreError::Constraint(_)
        ));
        store.delete_route("r1").await.unwrap();
        store.delete_upstream("up1").await.unwrap();
    }

    #[tokio::test]
    async fn test_aggregate_increments_accumulate() {
        let store = MemStore::new();
        let delta = UsageDelta {
            requests: 2,
            compute_units: 2.0,
            bytes_in: 10,
            bytes_out: 20,
            errors: 1,
            latency_ms_total: 30,
        };
        store.increment_aggregate("u1", "2026-04", &delta).await.unwrap();
        store.increment_aggregate("u1", "2026-04", &delta).await.unwrap();
        store.increment_aggregate("u1", "2026-05", &delta).await.unwrap();

        let april = store
            .get_aggregate("u1", "2026-04")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(april.requests, 4);
        assert_eq!(april.errors, 2);
        assert_eq!(april.mean_latency_ms(), 15.0);

        let history = store.history("u1", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].period, "2026-05");

        assert_eq!(store.summary("2026-04").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recent_events_newest_first() {
        let store = MemStore::new();
        let mut events = Vec::new();
        for i in 0..3 {
            events.push(UsageEvent {
                ts: Utc::now(),
                user_id: format!("u{i}"),
                key_id: "k".into(),
                route_id: "r".into(),
                method: "GET".into(),
                path: "/".into(),
                status: 200,
                latency_ms: 1,
                bytes_in: 0,
                bytes_out: 0,
                compute_units: 1.0,
                error: None,
            });
        }
        store.append_events(&events).await.unwrap();

        let recent = store.recent_events(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].user_id, "u2");
    }

    #[tokio::test]
    async fn test_settings_and_tls_cache() {
        let store = MemStore::new();
        store.set_setting("auth.header", "x-api-key", false).await.unwrap();
        store.set_setting("admin.jwt_secret", "s3cret", true).await.unwrap();
        assert_eq!(
            store.get_setting("auth.header").await.unwrap().as_deref(),
            Some("x-api-key")
        );
        assert_eq!(store.all_settings().await.unwrap().len(), 2);

        store.tls_put("cert:example.com", vec![1, 2, 3]).await.unwrap();
        assert_eq!(
            store.tls_get("cert:example.com").await.unwrap(),
            Some(vec![1, 2, 3])
        );
        store.tls_delete("cert:example.com").await.unwrap();
        assert_eq!(store.tls_get("cert:example.com").await.unwrap(), None);
    }
}
