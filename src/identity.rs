//! Caller identity and tenant resolution.
//!
//! The authentication layer scopes each unit of work in a [`CallerIdentity`] (see [`with_caller`]);
//! the resolver reads it back without ever writing to it.

use crate::tenant::DEFAULT_TENANT;
use std::future::Future;

/// Authenticated caller as seen by the routing core.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallerIdentity {
    pub username: Option<String>,
    pub tenant_id: Option<String>,
}

impl CallerIdentity {
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        CallerIdentity {
            username: None,
            tenant_id: Some(tenant_id.into()),
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }
}

tokio::task_local! {
    static CURRENT_CALLER: CallerIdentity;
}

/// Runs `fut` with `identity` as the current caller. Nested scopes shadow outer ones.
pub async fn with_caller<F: Future>(identity: CallerIdentity, fut: F) -> F::Output {
    CURRENT_CALLER.scope(identity, fut).await
}

/// Identity of the current task, if one was scoped.
pub fn current_caller() -> Option<CallerIdentity> {
    CURRENT_CALLER.try_with(Clone::clone).ok()
}

/// Read-only accessor for the ambient caller identity.
pub trait IdentitySource: Send + Sync {
    fn current(&self) -> Option<CallerIdentity>;
}

/// Reads the identity scoped by [`with_caller`].
#[derive(Clone, Copy, Debug, Default)]
pub struct TaskLocalIdentity;

impl IdentitySource for TaskLocalIdentity {
    fn current(&self) -> Option<CallerIdentity> {
        current_caller()
    }
}

/// A fixed identity, for maintenance jobs that act on behalf of one tenant.
#[derive(Clone, Debug, Default)]
pub struct StaticIdentity(pub Option<CallerIdentity>);

impl IdentitySource for StaticIdentity {
    fn current(&self) -> Option<CallerIdentity> {
        self.0.clone()
    }
}

#[derive(Clone, Debug, Default)]
pub struct TenantIdentityResolver<S = TaskLocalIdentity> {
    source: S,
}

impl<S: IdentitySource> TenantIdentityResolver<S> {
    pub fn new(source: S) -> Self {
        TenantIdentityResolver { source }
    }

    /// Tenant key for the current caller. A missing identity or a blank tenant id yields
    /// [`DEFAULT_TENANT`]; this never fails.
    pub fn resolve_current_tenant(&self) -> String {
        self.source
            .current()
            .and_then(|identity| identity.tenant_id)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_TENANT.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_identity_resolves_to_default() {
        let resolver = TenantIdentityResolver::new(StaticIdentity(None));
        assert_eq!(resolver.resolve_current_tenant(), DEFAULT_TENANT);
    }

    #[test]
    fn blank_tenant_resolves_to_default() {
        for blank in ["", "   ", "\t"] {
            let resolver = TenantIdentityResolver::new(StaticIdentity(Some(CallerIdentity::for_tenant(blank))));
            assert_eq!(resolver.resolve_current_tenant(), DEFAULT_TENANT);
        }
        let anonymous = CallerIdentity::default().with_username("anonymous");
        let resolver = TenantIdentityResolver::new(StaticIdentity(Some(anonymous)));
        assert_eq!(resolver.resolve_current_tenant(), DEFAULT_TENANT);
    }

    #[test]
    fn tenant_id_is_returned_trimmed() {
        let resolver = TenantIdentityResolver::new(StaticIdentity(Some(CallerIdentity::for_tenant(" acme "))));
        assert_eq!(resolver.resolve_current_tenant(), "acme");
    }

    #[test]
    fn task_local_is_absent_outside_scope() {
        assert!(current_caller().is_none());
        let resolver: TenantIdentityResolver = TenantIdentityResolver::default();
        assert_eq!(resolver.resolve_current_tenant(), DEFAULT_TENANT);
    }

    #[tokio::test]
    async fn task_local_scope_is_visible_and_nests() {
        let resolver: TenantIdentityResolver = TenantIdentityResolver::default();
        let (outer, inner) = with_caller(CallerIdentity::for_tenant("acme"), async {
            let outer = resolver.resolve_current_tenant();
            let inner = with_caller(CallerIdentity::for_tenant("globex"), async {
                resolver.resolve_current_tenant()
            })
            .await;
            (outer, inner)
        })
        .await;
        assert_eq!(outer, "acme");
        assert_eq!(inner, "globex");
        assert_eq!(resolver.resolve_current_tenant(), DEFAULT_TENANT);
    }
}
