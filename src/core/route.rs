/// Route resolution: client identity to a live route with its server pool
///
/// A `Route` binds one effective (database, user) identity to the scheme
/// that matched it and a dedicated `ServerPool`. Routes are created lazily
/// on first resolution and live for the process lifetime; the registry
/// guarantees at most one route per effective identity even when many
/// sessions resolve the same unseen identity concurrently.
use fnv::FnvHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::{RouteScheme, SchemeSet};
use crate::core::backend::ServerPool;

/// Effective client identity used as the route registry key.
///
/// Equality is exact string match, no normalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteIdentity {
    pub database: String,
    pub user: String,
}

impl RouteIdentity {
    pub fn new(database: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            user: user.into(),
        }
    }
}

/// A live binding of an effective identity to a scheme and its server pool
#[derive(Debug)]
pub struct Route {
    pub identity: RouteIdentity,
    pub scheme: Arc<RouteScheme>,
    pub pool: ServerPool,
}

/// Concurrent registry of routes, supporting match-or-create resolution
#[derive(Debug)]
pub struct RoutePool {
    schemes: Arc<SchemeSet>,
    connect_timeout: Duration,
    routes: RwLock<FnvHashMap<RouteIdentity, Arc<Route>>>,
}

impl RoutePool {
    pub fn new(schemes: Arc<SchemeSet>, connect_timeout: Duration) -> Self {
        Self {
            schemes,
            connect_timeout,
            routes: RwLock::new(FnvHashMap::default()),
        }
    }

    /// Resolve the client-supplied identity to a route.
    ///
    /// Matches a scheme for the requested database (or the configured
    /// default), applies the scheme's forced database/user overrides, then
    /// looks up or creates the route for the effective identity. Returns
    /// `None` when no scheme matches and no default is configured.
    pub async fn resolve(&self, database: &str, user: &str) -> Option<Arc<Route>> {
        let scheme = self.schemes.match_database(database)?;

        // Overrides substitute, they never merge.
        let database = scheme.forced_database.as_deref().unwrap_or(database);
        let user = scheme.forced_user.as_deref().unwrap_or(user);
        let identity = RouteIdentity::new(database, user);

        {
            let routes = self.routes.read().await;
            if let Some(route) = routes.get(&identity) {
                return Some(Arc::clone(route));
            }
        }

        let mut routes = self.routes.write().await;
        // Re-check under the write lock: a concurrent resolver may have
        // materialized the route while we waited.
        if let Some(route) = routes.get(&identity) {
            return Some(Arc::clone(route));
        }

        let route = Arc::new(Route {
            identity: identity.clone(),
            pool: ServerPool::new(scheme.target, scheme.pool_size, self.connect_timeout),
            scheme,
        });
        routes.insert(identity.clone(), Arc::clone(&route));
        debug!(
            "C: created route for database '{}' user '{}'",
            identity.database, identity.user
        );
        Some(route)
    }

    /// Number of materialized routes
    pub async fn route_count(&self) -> usize {
        self.routes.read().await.len()
    }
}
