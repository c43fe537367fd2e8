//! Example consumer: a separate Rust project that serves tenant administration and a
//! tenant-scoped query on top of tenant-router.
//!
//! Run from repo root: `cargo run -p example-consumer`
//! With `TENANT_TRUST_HEADER=true`, send `X-Tenant-ID: <name>` to route `/whoami` to that
//! tenant's database.

use axum::{extract::State, middleware, routing::get, Json, Router};
use tenant_router::{
    common_routes_with_ready, ensure_database_exists, scope_caller_identity, scope_caller_identity_from_header,
    start, tenant_routes, AppError, AppState, ConnectionProvider, CurrentTenant, RoutingConfig,
};
use tokio::net::TcpListener;

/// Reports which database the caller's connection actually landed on.
async fn whoami(
    State(state): State<AppState>,
    CurrentTenant(tenant): CurrentTenant,
) -> Result<Json<serde_json::Value>, AppError> {
    let mut conn = state.router.acquire().await?;
    let (database,): (String,) = sqlx::query_as("SELECT current_database()")
        .fetch_one(&mut *conn)
        .await?;
    Ok(Json(serde_json::json!({ "tenant": tenant, "database": database })))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tenant_router=info,example_consumer=info")),
        )
        .init();

    let config = RoutingConfig::from_env()?;
    if let Some(url) = config.default_source.url.as_deref() {
        ensure_database_exists(url).await?;
    }
    let routing = start(&config).await?;
    if !routing.startup.is_complete() {
        tracing::warn!("{} tenants failed to load", routing.startup.failed.len());
    }
    let state = routing.app_state();

    let whoami_routes = Router::new().route("/whoami", get(whoami));
    let whoami_routes = if config.trust_tenant_header {
        tracing::warn!("trusting the X-Tenant-ID header for tenant selection");
        whoami_routes.layer(middleware::from_fn(scope_caller_identity_from_header))
    } else {
        whoami_routes.layer(middleware::from_fn(scope_caller_identity))
    };
    let whoami_routes = whoami_routes.with_state(state.clone());
    let app = Router::new()
        .merge(common_routes_with_ready(state.clone()))
        .merge(whoami_routes)
        .nest("/api", tenant_routes(state));

    let bind = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:3000".into());
    let listener = TcpListener::bind(&bind).await?;
    tracing::info!("Example consumer listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    routing.shutdown().await;
    Ok(())
}
