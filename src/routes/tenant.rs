//! Tenant administration routes, scoped in the caller's identity.

use crate::extractors::scope_caller_identity;
use crate::handlers::tenant::{
    active_tenants, create_tenant, current_tenant, delete_tenant, get_tenant, list_tenants, update_tenant,
};
use crate::state::AppState;
use axum::{middleware, routing::get, Router};
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;

/// Descriptor bodies are small; anything larger is rejected.
const MAX_BODY_BYTES: usize = 64 * 1024;

pub fn tenant_routes(state: AppState) -> Router {
    Router::new()
        .route("/tenants", get(list_tenants).post(create_tenant).put(update_tenant))
        .route("/tenants/active", get(active_tenants))
        .route("/tenants/current", get(current_tenant))
        .route("/tenants/:id", get(get_tenant).delete(delete_tenant))
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(scope_caller_identity))
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)),
        )
        .with_state(state)
}
