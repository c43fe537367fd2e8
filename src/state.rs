//! Shared state for the HTTP routes.

use crate::admission::AdmissionHandle;
use crate::registry::TenantPoolRegistry;
use crate::router::ConnectionRouter;
use crate::store::TenantStore;
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: TenantStore,
    pub registry: Arc<TenantPoolRegistry<PgPool>>,
    pub router: ConnectionRouter<PgPool>,
    /// Admin writes go through here so the registry is only changed by the admission loop.
    pub admission: AdmissionHandle,
}
