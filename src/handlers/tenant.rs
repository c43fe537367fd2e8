//! Tenant administration: CRUD over descriptor rows. Writes are followed by an admission or
//! eviction message so the registry picks the change up without a restart.

use crate::admission::{AdmissionHandle, TenantSource};
use crate::error::{AppError, RoutingError};
use crate::extractors::CurrentTenant;
use crate::response::{success_many, success_one, SuccessOne};
use crate::state::AppState;
use crate::tenant::TenantDescriptor;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::json;

type OneResponse = (StatusCode, Json<SuccessOne<TenantDescriptor>>);

/// Meta block describing whether the tenant is routable after the write.
fn admission_meta(result: Result<(), RoutingError>) -> serde_json::Value {
    match result {
        Ok(()) => json!({ "admitted": true }),
        Err(e) => {
            tracing::warn!("tenant saved but not admitted: {}", e);
            json!({ "admitted": false, "error": e.to_string() })
        }
    }
}

/// Evicts `name`; a tenant that was never admitted is not an error here.
async fn evict_quietly(admission: &AdmissionHandle, name: &str) -> Result<(), AppError> {
    match admission.evict(name).await {
        Ok(()) | Err(RoutingError::TenantNotFound(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Brings the registry in line with a saved row. A renamed tenant loses its pool under the old
/// name before the new name is admitted.
async fn readmit(
    admission: &AdmissionHandle,
    previous_name: Option<&str>,
    saved: &TenantDescriptor,
) -> Result<serde_json::Value, AppError> {
    if let Some(previous) = previous_name.filter(|p| *p != saved.name) {
        evict_quietly(admission, previous).await?;
    }
    Ok(admission_meta(admission.admit(saved.clone()).await))
}

async fn create(state: &AppState, descriptor: TenantDescriptor) -> Result<OneResponse, AppError> {
    let saved = state.store.insert(&descriptor).await?;
    tracing::info!(tenant = %saved.name, "tenant created");
    let meta = readmit(&state.admission, None, &saved).await?;
    Ok(success_one(StatusCode::CREATED, saved, Some(meta)))
}

/// POST /tenants. The body must not carry an id.
pub async fn create_tenant(
    State(state): State<AppState>,
    Json(descriptor): Json<TenantDescriptor>,
) -> Result<OneResponse, AppError> {
    if descriptor.id.is_some() {
        return Err(AppError::BadRequest("a new tenant cannot already have an id".into()));
    }
    create(&state, descriptor).await
}

/// PUT /tenants. Without an id this creates the tenant.
pub async fn update_tenant(
    State(state): State<AppState>,
    Json(descriptor): Json<TenantDescriptor>,
) -> Result<OneResponse, AppError> {
    let Some(id) = descriptor.id else {
        return create(&state, descriptor).await;
    };
    let previous = state
        .store
        .find_by_id(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("tenant {}", id)))?;
    let saved = state
        .store
        .update(id, &descriptor)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("tenant {}", id)))?;
    tracing::info!(tenant = %saved.name, "tenant updated");
    let meta = readmit(&state.admission, Some(&previous.name), &saved).await?;
    Ok(success_one(StatusCode::OK, saved, Some(meta)))
}

/// GET /tenants
pub async fn list_tenants(State(state): State<AppState>) -> Result<impl axum::response::IntoResponse, AppError> {
    let rows = state.store.find_all().await?;
    Ok(success_many(rows))
}

/// GET /tenants/:id
pub async fn get_tenant(State(state): State<AppState>, Path(id): Path<i64>) -> Result<OneResponse, AppError> {
    let descriptor = state
        .store
        .find_by_id(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("tenant {}", id)))?;
    let routable = state.registry.contains(&descriptor.name);
    Ok(success_one(StatusCode::OK, descriptor, Some(json!({ "admitted": routable }))))
}

/// DELETE /tenants/:id. The tenant's pool is closed once its connections are returned.
pub async fn delete_tenant(State(state): State<AppState>, Path(id): Path<i64>) -> Result<StatusCode, AppError> {
    let removed = state
        .store
        .delete(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("tenant {}", id)))?;
    evict_quietly(&state.admission, &removed.name).await?;
    tracing::info!(tenant = %removed.name, "tenant deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /tenants/active: tenant keys with a live pool.
pub async fn active_tenants(State(state): State<AppState>) -> impl axum::response::IntoResponse {
    success_many(state.registry.tenants())
}

/// GET /tenants/current: where the calling request routes.
pub async fn current_tenant(
    State(state): State<AppState>,
    CurrentTenant(tenant): CurrentTenant,
) -> Json<serde_json::Value> {
    let registered = state.registry.contains(&tenant);
    Json(json!({ "tenant": tenant, "registered": registered }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::spawn_admission_loop;
    use crate::migration::{Changelog, ChangelogProvisioner, ProvisionPolicy};
    use crate::pool::PgPoolFactory;
    use crate::registry::TenantPoolRegistry;
    use crate::router::ConnectionRouter;
    use crate::routes::tenant_routes;
    use crate::store::TenantStore;
    use crate::test_support::{descriptor, MemoryFactory, MemoryPool, RecordingProvisioner};
    use crate::extractors::TENANT_ID_HEADER;
    use axum::body::Body;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    /// State over a pool that never connects; only paths that stop before the database are usable.
    fn offline_state() -> AppState {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(200))
            .connect_lazy("postgres://u:p@127.0.0.1:1/offline")
            .unwrap();
        let registry = Arc::new(TenantPoolRegistry::bootstrap(
            pool.clone(),
            Arc::new(PgPoolFactory::default()),
            Arc::new(ChangelogProvisioner::new(Changelog::default(), "public")),
            ProvisionPolicy::Never,
        ));
        let (admission, _task) = spawn_admission_loop(Arc::clone(&registry), 4);
        AppState {
            store: TenantStore::new(pool, "multitenant"),
            router: ConnectionRouter::new(Arc::clone(&registry)),
            registry,
            admission,
        }
    }

    fn json_request(method: &str, body: serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri("/tenants")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn tenant_json(name: &str, id: Option<i64>) -> serde_json::Value {
        json!({
            "id": id,
            "name": name,
            "url": format!("postgres://db/{}", name),
            "username": "app",
            "password": "secret",
            "initialize": true
        })
    }

    #[tokio::test]
    async fn post_with_id_is_bad_request() {
        let app = tenant_routes(offline_state());
        let response = app.oneshot(json_request("POST", tenant_json("acme", Some(3)))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["code"], "bad_request");
    }

    #[tokio::test]
    async fn put_without_id_takes_create_path() {
        // Create validates before touching the database; update would look the row up first.
        let app = tenant_routes(offline_state());
        let response = app
            .oneshot(json_request("PUT", tenant_json("default", None)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body_json(response).await["error"]["code"], "validation_error");
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let app = tenant_routes(offline_state());
        let body = vec![b' '; 128 * 1024];
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/tenants")
            .header("content-type", "application/json")
            .header("content-length", body.len())
            .body(Body::from(body))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn active_lists_default_and_current_ignores_header() {
        let state = offline_state();
        let response = tenant_routes(state.clone())
            .oneshot(axum::http::Request::builder().uri("/tenants/active").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["data"], json!(["default"]));
        assert_eq!(body["meta"]["count"], 1);

        let request = axum::http::Request::builder()
            .uri("/tenants/current")
            .header(TENANT_ID_HEADER, "acme")
            .body(Body::empty())
            .unwrap();
        let response = tenant_routes(state).oneshot(request).await.unwrap();
        assert_eq!(body_json(response).await, json!({ "tenant": "default", "registered": true }));
    }

    fn memory_admission() -> (Arc<TenantPoolRegistry<MemoryPool>>, AdmissionHandle) {
        let registry = Arc::new(TenantPoolRegistry::bootstrap(
            MemoryPool::new("db://bootstrap", 1, Duration::from_millis(50)),
            Arc::new(MemoryFactory::new()),
            Arc::new(RecordingProvisioner::default()),
            ProvisionPolicy::Flagged,
        ));
        let (admission, _task) = spawn_admission_loop(Arc::clone(&registry), 4);
        (registry, admission)
    }

    #[tokio::test]
    async fn rename_evicts_old_key() {
        let (registry, admission) = memory_admission();
        readmit(&admission, None, &descriptor("acme", 1)).await.unwrap();
        assert!(registry.contains("acme"));

        let meta = readmit(&admission, Some("acme"), &descriptor("acme-corp", 1)).await.unwrap();
        assert_eq!(meta, json!({ "admitted": true }));
        assert!(!registry.contains("acme"));
        assert!(registry.contains("acme-corp"));
    }

    #[tokio::test]
    async fn update_without_rename_replaces_pool() {
        let (registry, admission) = memory_admission();
        readmit(&admission, None, &descriptor("acme", 1)).await.unwrap();
        let before = registry.get("acme").unwrap();

        let mut moved = descriptor("acme", 1);
        moved.url = "db://acme-replica".into();
        readmit(&admission, Some("acme"), &moved).await.unwrap();
        assert_eq!(registry.get("acme").unwrap().inner().url, "db://acme-replica");
        assert!(!Arc::ptr_eq(&before, &registry.get("acme").unwrap()));
    }

    #[tokio::test]
    async fn failed_admission_is_reported_in_meta() {
        let (_registry, admission) = memory_admission();
        let meta = readmit(&admission, None, &TenantDescriptor::new("acme", "", "u", "p").with_id(1))
            .await
            .unwrap();
        assert_eq!(meta["admitted"], false);
        assert!(meta["error"].as_str().unwrap().contains("acme"));
    }

    #[tokio::test]
    async fn delete_evicts_and_tolerates_unknown_tenant() {
        let (registry, admission) = memory_admission();
        readmit(&admission, None, &descriptor("acme", 1)).await.unwrap();
        evict_quietly(&admission, "acme").await.unwrap();
        assert!(!registry.contains("acme"));
        evict_quietly(&admission, "never-admitted").await.unwrap();
    }
}
