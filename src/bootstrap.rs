//! Startup composition: default pool, descriptor store, registry, admission loop and watcher.

use crate::admission::{last_seen_id, spawn_admission_loop, spawn_tenant_watcher, AdmissionHandle, TenantSource};
use crate::error::RoutingError;
use crate::migration::{Changelog, ChangelogProvisioner, ProvisionPolicy};
use crate::pool::PgPoolFactory;
use crate::registry::{LoadReport, TenantPoolRegistry};
use crate::router::ConnectionRouter;
use crate::settings::RoutingConfig;
use crate::state::AppState;
use crate::store::TenantStore;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::task::JoinHandle;

const ADMISSION_BUFFER: usize = 64;

/// Everything a running service holds on to.
pub struct Routing {
    pub registry: Arc<TenantPoolRegistry<PgPool>>,
    pub router: ConnectionRouter<PgPool>,
    pub admission: AdmissionHandle,
    pub store: TenantStore,
    /// Tenants loaded at startup.
    pub startup: LoadReport,
    admission_task: JoinHandle<()>,
    watcher: Option<JoinHandle<()>>,
}

impl Routing {
    pub fn app_state(&self) -> AppState {
        AppState {
            store: self.store.clone(),
            registry: Arc::clone(&self.registry),
            router: self.router.clone(),
            admission: self.admission.clone(),
        }
    }

    /// Stops the watcher and admission loop, then closes every pool.
    pub async fn shutdown(self) {
        if let Some(watcher) = self.watcher {
            watcher.abort();
        }
        self.admission_task.abort();
        self.registry.shutdown().await;
        tracing::info!("tenant routing stopped");
    }
}

async fn provisioner(config: &RoutingConfig) -> Result<ChangelogProvisioner, RoutingError> {
    let settings = &config.provisioner;
    let changelog = if settings.policy == ProvisionPolicy::Never {
        Changelog::default()
    } else {
        Changelog::load(&settings.changelog_path).await?
    };
    tracing::info!(
        "changelog {} has {} change sets",
        settings.changelog_path.display(),
        changelog.change_sets.len()
    );
    Ok(ChangelogProvisioner::new(changelog, settings.schema.clone()).with_drop_first(settings.drop_first))
}

/// Connects the default data source, registers every stored tenant, and starts runtime admission.
///
/// Fails only when the default data source or the changelog is unusable; a tenant that cannot be
/// admitted is logged and left out.
pub async fn start(config: &RoutingConfig) -> Result<Routing, RoutingError> {
    let default_pool = PgPoolFactory::connect_default(&config.default_source, &config.default_pool).await?;

    let store = TenantStore::new(default_pool.clone(), config.registry_schema.clone());
    store
        .ensure_table()
        .await
        .map_err(|e| RoutingError::Configuration(format!("tenant table: {}", e)))?;

    let registry = Arc::new(TenantPoolRegistry::bootstrap(
        default_pool,
        Arc::new(PgPoolFactory::new(config.tenant_pool_settings())),
        Arc::new(provisioner(config).await?),
        config.provisioner.policy,
    ));

    let descriptors = store.find_all().await?;
    let last_seen = last_seen_id(&descriptors);
    let startup = registry.load_all(descriptors).await;

    let (admission, admission_task) = spawn_admission_loop(Arc::clone(&registry), ADMISSION_BUFFER);
    let watcher = config.poll_interval.map(|interval| {
        tracing::info!("polling for new tenants every {}s", interval.as_secs());
        spawn_tenant_watcher(Arc::new(store.clone()), admission.clone(), interval, last_seen)
    });

    Ok(Routing {
        router: ConnectionRouter::new(Arc::clone(&registry)),
        registry,
        admission,
        store,
        startup,
        admission_task,
        watcher,
    })
}
