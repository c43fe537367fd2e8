//! Tenant router: per-tenant PostgreSQL connection pools selected by the caller's identity.
//!
//! A default pool is created at startup from configuration. Every row of the tenant descriptor
//! table gets its own pool, registered under the tenant name after the tenant's schema has been
//! provisioned. Each unit of work asks the [`ConnectionRouter`] for a connection and gets one
//! from the pool of the tenant it runs for.

pub mod admission;
pub mod bootstrap;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod identity;
pub mod migration;
pub mod pool;
pub mod registry;
pub mod response;
pub mod router;
pub mod routes;
pub mod settings;
pub mod state;
pub mod store;
pub mod tenant;

#[cfg(test)]
mod test_support;

pub use admission::{spawn_admission_loop, spawn_tenant_watcher, AdmissionHandle, TenantSource};
pub use bootstrap::{start, Routing};
pub use error::{AppError, RoutingError};
pub use extractors::{scope_caller_identity, scope_caller_identity_from_header, CurrentTenant, TENANT_ID_HEADER};
pub use identity::{current_caller, with_caller, CallerIdentity, IdentitySource, TenantIdentityResolver};
pub use migration::{ChangeSet, Changelog, ChangelogProvisioner, ProvisionPolicy, SchemaProvisioner};
pub use pool::{ConnectionPool, ConnectionPoolFactory, PgPoolFactory, TenantPool};
pub use registry::{LoadReport, TenantPoolRegistry};
pub use response::{success_many, success_one};
pub use router::{ConnectionProvider, ConnectionRouter};
pub use routes::{common_routes, common_routes_with_ready, tenant_routes};
pub use settings::{DataSourceSettings, PoolSettings, ProvisionerSettings, RoutingConfig};
pub use state::AppState;
pub use store::{ensure_database_exists, TenantStore};
pub use tenant::{TenantDescriptor, DEFAULT_TENANT};
