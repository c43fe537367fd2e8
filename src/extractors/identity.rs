//! Scope each request in the caller's identity, and extract the resolved tenant key.

use crate::identity::{with_caller, CallerIdentity, TenantIdentityResolver};
use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Request},
    http::request::Parts,
    middleware::Next,
    response::Response,
};

/// Header naming the tenant for [`scope_caller_identity_from_header`]. Default: `X-Tenant-ID`.
pub const TENANT_ID_HEADER: &str = "X-Tenant-ID";

fn header_identity(request: &Request) -> Option<CallerIdentity> {
    request
        .headers()
        .get(TENANT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(CallerIdentity::for_tenant)
}

fn extension_identity(request: &Request) -> Option<CallerIdentity> {
    request.extensions().get::<CallerIdentity>().cloned()
}

async fn run_scoped(identity: Option<CallerIdentity>, request: Request, next: Next) -> Response {
    match identity {
        Some(identity) => with_caller(identity, next.run(request)).await,
        None => next.run(request).await,
    }
}

/// Middleware: runs the rest of the request inside the caller's identity scope.
///
/// Only the [`CallerIdentity`] an authentication layer in front of this one attached as a request
/// extension is trusted. Without one the request runs unscoped and routes to the default tenant.
pub async fn scope_caller_identity(request: Request, next: Next) -> Response {
    let identity = extension_identity(&request);
    run_scoped(identity, request, next).await
}

/// Like [`scope_caller_identity`], but falls back to the `X-Tenant-ID` header when no identity
/// was attached. The header is not authenticated: mount this only behind a gateway that sets or
/// strips it.
pub async fn scope_caller_identity_from_header(request: Request, next: Next) -> Response {
    let identity = extension_identity(&request).or_else(|| header_identity(&request));
    run_scoped(identity, request, next).await
}

/// Tenant key the current request routes to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CurrentTenant(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentTenant
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(_parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let resolver: TenantIdentityResolver = TenantIdentityResolver::default();
        Ok(CurrentTenant(resolver.resolve_current_tenant()))
    }
}
