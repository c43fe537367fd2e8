//! Per-operation connection selection.

use crate::error::RoutingError;
use crate::identity::{IdentitySource, TaskLocalIdentity, TenantIdentityResolver};
use crate::pool::{ConnectionPool, TenantPool};
use crate::registry::TenantPoolRegistry;
use async_trait::async_trait;
use std::sync::Arc;

/// What the persistence layer calls into: one connection per unit of work.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    type Connection: Send;

    /// Connection for the current caller's tenant.
    async fn acquire(&self) -> Result<Self::Connection, RoutingError>;

    /// Connection for work that is not tenant scoped (startup, maintenance).
    async fn acquire_any(&self) -> Result<Self::Connection, RoutingError>;
}

pub struct ConnectionRouter<P: ConnectionPool, S = TaskLocalIdentity> {
    registry: Arc<TenantPoolRegistry<P>>,
    resolver: TenantIdentityResolver<S>,
}

impl<P: ConnectionPool, S: Clone> Clone for ConnectionRouter<P, S> {
    fn clone(&self) -> Self {
        ConnectionRouter {
            registry: Arc::clone(&self.registry),
            resolver: self.resolver.clone(),
        }
    }
}

impl<P: ConnectionPool> ConnectionRouter<P> {
    pub fn new(registry: Arc<TenantPoolRegistry<P>>) -> Self {
        Self::with_resolver(registry, TenantIdentityResolver::default())
    }
}

impl<P: ConnectionPool, S: IdentitySource> ConnectionRouter<P, S> {
    pub fn with_resolver(registry: Arc<TenantPoolRegistry<P>>, resolver: TenantIdentityResolver<S>) -> Self {
        ConnectionRouter { registry, resolver }
    }

    pub fn registry(&self) -> &Arc<TenantPoolRegistry<P>> {
        &self.registry
    }

    /// Pool for the current caller. An unknown tenant falls back to the default pool, since
    /// admission can lag behind the descriptor row being written.
    pub fn current_pool(&self) -> Arc<TenantPool<P>> {
        let key = self.resolver.resolve_current_tenant();
        match self.registry.get(&key) {
            Some(pool) => {
                tracing::debug!(tenant = %key, "selected tenant pool");
                pool
            }
            None => {
                tracing::debug!(tenant = %key, "tenant not registered, using default pool");
                self.registry.default_pool()
            }
        }
    }
}

#[async_trait]
impl<P, S> ConnectionProvider for ConnectionRouter<P, S>
where
    P: ConnectionPool,
    S: IdentitySource,
{
    type Connection = P::Connection;

    async fn acquire(&self) -> Result<P::Connection, RoutingError> {
        self.current_pool().acquire().await
    }

    async fn acquire_any(&self) -> Result<P::Connection, RoutingError> {
        self.registry.default_pool().acquire().await
    }
}
