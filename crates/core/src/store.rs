//! Storage traits consumed by the gateway core. Backends (embedded or
//! remote) implement these; the core never touches a concrete engine.

use async_trait::async_trait;
use tokio::sync::watch;

use crate::model::{
    ApiKey, Plan, Route, Upstream, UsageAggregate, UsageDelta, UsageEvent, User,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create_user(&self, user: User) -> Result<(), StoreError>;
    async fn get_user(&self, id: &str) -> Result<User, StoreError>;
    async fn get_user_by_email(&self, email: &str) -> Result<User, StoreError>;
    async fn update_user(&self, user: User) -> Result<(), StoreError>;
    async fn delete_user(&self, id: &str) -> Result<(), StoreError>;
    async fn list_users(&self, limit: usize, offset: usize) -> Result<Vec<User>, StoreError>;
}

#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn create_key(&self, key: ApiKey) -> Result<(), StoreError>;
    async fn get_key(&self, id: &str) -> Result<ApiKey, StoreError>;
    /// Candidate set for validation; typically at most a few keys share a prefix.
    async fn list_keys_by_prefix(&self, prefix: &str) -> Result<Vec<ApiKey>, StoreError>;
    async fn list_keys_by_user(&self, user_id: &str) -> Result<Vec<ApiKey>, StoreError>;
    async fn update_key(&self, key: ApiKey) -> Result<(), StoreError>;
    async fn delete_key(&self, id: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn create_plan(&self, plan: Plan) -> Result<(), StoreError>;
    async fn get_plan(&self, id: &str) -> Result<Plan, StoreError>;
    async fn get_default_plan(&self) -> Result<Option<Plan>, StoreError>;
    async fn list_plans(&self) -> Result<Vec<Plan>, StoreError>;
    async fn update_plan(&self, plan: Plan) -> Result<(), StoreError>;
    /// Fails with `Constraint` while any user references the plan.
    async fn delete_plan(&self, id: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RouteStore: Send + Sync {
    async fn create_route(&self, route: Route) -> Result<(), StoreError>;
    async fn get_route(&self, id: &str) -> Result<Route, StoreError>;
    /// All routes ordered by (priority desc, created_at asc).
    async fn list_routes(&self) -> Result<Vec<Route>, StoreError>;
    async fn update_route(&self, route: Route) -> Result<(), StoreError>;
    async fn delete_route(&self, id: &str) -> Result<(), StoreError>;
    /// Bumped on every route/upstream mutation; drives snapshot rebuilds.
    fn watch_routes(&self) -> watch::Receiver<u64>;
}

#[async_trait]
pub trait UpstreamStore: Send + Sync {
    async fn create_upstream(&self, upstream: Upstream) -> Result<(), StoreError>;
    async fn get_upstream(&self, id: &str) -> Result<Upstream, StoreError>;
    async fn list_upstreams(&self) -> Result<Vec<Upstream>, StoreError>;
    async fn update_upstream(&self, upstream: Upstream) -> Result<(), StoreError>;
    async fn delete_upstream(&self, id: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn append_events(&self, events: &[UsageEvent]) -> Result<(), StoreError>;
    async fn increment_aggregate(
        &self,
        user_id: &str,
        period: &str,
        delta: &UsageDelta,
    ) -> Result<(), StoreError>;
    async fn get_aggregate(
        &self,
        user_id: &str,
        period: &str,
    ) -> Result<Option<UsageAggregate>, StoreError>;
    /// All aggregates for a period, for billing roll-ups.
    async fn summary(&self, period: &str) -> Result<Vec<UsageAggregate>, StoreError>;
    /// A user's aggregates over past periods, newest first.
    async fn history(&self, user_id: &str, limit: usize) -> Result<Vec<UsageAggregate>, StoreError>;
    /// Most recent raw events, newest first.
    async fn recent_events(&self, limit: usize) -> Result<Vec<UsageEvent>, StoreError>;
}

#[async_trait]
pub trait TlsCacheStore: Send + Sync {
    async fn tls_get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn tls_put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;
    async fn tls_delete(&self, key: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError>;
    /// `encrypted` marks the value as secret; backends may encrypt at rest.
    async fn set_setting(&self, key: &str, value: &str, encrypted: bool)
        -> Result<(), StoreError>;
    async fn all_settings(
        &self,
    ) -> Result<std::collections::HashMap<String, String>, StoreError>;
}

/// The full store surface the gateway is assembled against.
pub trait Store:
    UserStore
    + KeyStore
    + PlanStore
    + RouteStore
    + UpstreamStore
    + UsageStore
    + TlsCacheStore
    + SettingsStore
{
}

impl<T> Store for T where
    T: UserStore
        + KeyStore
        + PlanStore
        + RouteStore
        + UpstreamStore
        + UsageStore
        + TlsCacheStore
        + SettingsStore
{
}
