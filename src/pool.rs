//! Connection pools and the factory that builds one per tenant.

use crate::error::RoutingError;
use crate::settings::{DataSourceSettings, PoolSettings};
use crate::tenant::{TenantDescriptor, DEFAULT_TENANT};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};

/// A reusable source of live connections to one physical database.
#[async_trait]
pub trait ConnectionPool: Send + Sync + 'static {
    type Connection: Send;

    /// Checks out a connection, waiting up to the pool's acquire timeout.
    /// Dropping the returned future abandons the wait; a dropped connection goes back to the pool.
    async fn acquire(&self) -> Result<Self::Connection, sqlx::Error>;

    /// Stops handing out connections. Resolves once every checked-out connection has been returned.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

#[async_trait]
impl ConnectionPool for PgPool {
    type Connection = PoolConnection<Postgres>;

    async fn acquire(&self) -> Result<Self::Connection, sqlx::Error> {
        PgPool::acquire(self).await
    }

    async fn close(&self) {
        PgPool::close(self).await
    }

    fn is_closed(&self) -> bool {
        PgPool::is_closed(self)
    }
}

/// A pool bound to one tenant key. Only the registry holds these.
pub struct TenantPool<P> {
    key: String,
    descriptor: Option<TenantDescriptor>,
    inner: P,
}

impl<P: ConnectionPool> TenantPool<P> {
    /// The bootstrap pool, registered under [`DEFAULT_TENANT`].
    pub fn default_tenant(inner: P) -> Self {
        TenantPool {
            key: DEFAULT_TENANT.to_string(),
            descriptor: None,
            inner,
        }
    }

    pub fn for_tenant(descriptor: TenantDescriptor, inner: P) -> Self {
        TenantPool {
            key: descriptor.name.clone(),
            descriptor: Some(descriptor),
            inner,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The descriptor this pool was built from; `None` for the default pool.
    pub fn descriptor(&self) -> Option<&TenantDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub async fn acquire(&self) -> Result<P::Connection, RoutingError> {
        self.inner.acquire().await.map_err(|e| match e {
            sqlx::Error::PoolTimedOut => RoutingError::PoolExhausted {
                tenant: self.key.clone(),
            },
            other => RoutingError::Db(other),
        })
    }

    pub async fn close(&self) {
        self.inner.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// Builds a pool from a descriptor. Construction only: no connection is opened here.
pub trait ConnectionPoolFactory<P>: Send + Sync {
    fn create(&self, descriptor: &TenantDescriptor) -> Result<P, RoutingError>;
}

fn pool_options(settings: &PoolSettings) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .acquire_timeout(settings.acquire_timeout)
        .idle_timeout(settings.idle_timeout)
}

/// PostgreSQL pools, lazily connected. Each tenant pool gets this factory's settings and
/// nothing from the default pool.
#[derive(Clone, Debug, Default)]
pub struct PgPoolFactory {
    settings: PoolSettings,
}

impl PgPoolFactory {
    pub fn new(settings: PoolSettings) -> Self {
        PgPoolFactory { settings }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Connects the bootstrap pool eagerly so a bad default data source fails startup.
    pub async fn connect_default(source: &DataSourceSettings, settings: &PoolSettings) -> Result<PgPool, RoutingError> {
        source.validate()?;
        let opts = source.connect_options().map_err(RoutingError::Configuration)?;
        let pool = pool_options(settings).connect_with(opts).await?;
        Ok(pool)
    }
}

impl ConnectionPoolFactory<PgPool> for PgPoolFactory {
    fn create(&self, descriptor: &TenantDescriptor) -> Result<PgPool, RoutingError> {
        let source = DataSourceSettings::from_url(descriptor.url.clone())
            .with_credentials(descriptor.username.clone(), descriptor.password.clone());
        let opts = source
            .connect_options()
            .map_err(|reason| RoutingError::provisioning(&descriptor.name, reason))?;
        Ok(pool_options(&self.settings).connect_lazy_with(opts))
    }
}
