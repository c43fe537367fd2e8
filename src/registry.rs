//! In-memory tenant pool registry: tenant key -> live pool.
//!
//! Readers take a short read lock and clone an `Arc`; a tenant's pool is inserted only after it
//! has been built and provisioned, so a reader sees either no pool or a ready one. Pool building
//! and provisioning run outside the map lock, serialized per tenant key only.

use crate::error::RoutingError;
use crate::migration::{ProvisionPolicy, SchemaProvisioner};
use crate::pool::{ConnectionPool, ConnectionPoolFactory, TenantPool};
use crate::tenant::{TenantDescriptor, DEFAULT_TENANT};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

/// How often a retired pool checks whether its last caller has let go.
const RETIRE_POLL: Duration = Duration::from_millis(5);

/// Outcome of [`TenantPoolRegistry::load_all`].
#[derive(Debug, Default)]
pub struct LoadReport {
    pub admitted: Vec<String>,
    pub failed: Vec<(String, RoutingError)>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct TenantPoolRegistry<P: ConnectionPool> {
    pools: RwLock<HashMap<String, Arc<TenantPool<P>>>>,
    default_pool: Arc<TenantPool<P>>,
    factory: Arc<dyn ConnectionPoolFactory<P>>,
    provisioner: Arc<dyn SchemaProvisioner<P>>,
    policy: ProvisionPolicy,
    admission_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    retiring: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl<P: ConnectionPool> TenantPoolRegistry<P> {
    /// Creates the registry with `default_pool` registered under [`DEFAULT_TENANT`]. Being the
    /// constructor, this runs exactly once and before anything can route through the registry.
    pub fn bootstrap(
        default_pool: P,
        factory: Arc<dyn ConnectionPoolFactory<P>>,
        provisioner: Arc<dyn SchemaProvisioner<P>>,
        policy: ProvisionPolicy,
    ) -> Self {
        let default_pool = Arc::new(TenantPool::default_tenant(default_pool));
        let mut pools = HashMap::new();
        pools.insert(DEFAULT_TENANT.to_string(), Arc::clone(&default_pool));
        TenantPoolRegistry {
            pools: RwLock::new(pools),
            default_pool,
            factory,
            provisioner,
            policy,
            admission_locks: Mutex::new(HashMap::new()),
            retiring: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> ProvisionPolicy {
        self.policy
    }

    pub fn get(&self, key: &str) -> Option<Arc<TenantPool<P>>> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn default_pool(&self) -> Arc<TenantPool<P>> {
        Arc::clone(&self.default_pool)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Registered tenant keys, default included, sorted.
    pub fn tenants(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Admits every descriptor. Tenants are processed concurrently and independently: a failure
    /// is logged and reported for that tenant only.
    pub async fn load_all(&self, descriptors: Vec<TenantDescriptor>) -> LoadReport {
        let names: Vec<String> = descriptors.iter().map(|d| d.name.clone()).collect();
        let results = futures::future::join_all(descriptors.into_iter().map(|d| self.admit(d))).await;

        let mut report = LoadReport::default();
        for (name, result) in names.into_iter().zip(results) {
            match result {
                Ok(()) => report.admitted.push(name),
                Err(e) => {
                    tracing::error!(tenant = %name, "tenant not configured: {}", e);
                    report.failed.push((name, e));
                }
            }
        }
        tracing::info!(
            "loaded {} tenants ({} failed)",
            report.admitted.len(),
            report.failed.len()
        );
        report
    }

    /// Builds, provisions and publishes a pool for `descriptor`. A pool already registered under
    /// the same name is replaced and closed once its checked-out connections are returned.
    /// Concurrent admissions of one name run one at a time.
    pub async fn admit(&self, descriptor: TenantDescriptor) -> Result<(), RoutingError> {
        let key = descriptor.name.clone();
        if key.trim().is_empty() {
            return Err(RoutingError::provisioning(&key, "tenant name is blank"));
        }
        if key == DEFAULT_TENANT {
            return Err(RoutingError::provisioning(&key, "the default tenant cannot be replaced"));
        }

        let lock = self.admission_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            self.admit_locked(&key, descriptor).await
        };
        self.release_admission_lock(&key, lock);
        result
    }

    async fn admit_locked(&self, key: &str, descriptor: TenantDescriptor) -> Result<(), RoutingError> {
        if self.is_shut_down() {
            return Err(RoutingError::provisioning(key, "registry is shut down"));
        }
        let inner = self.factory.create(&descriptor)?;
        let pool = Arc::new(TenantPool::for_tenant(descriptor, inner));

        let provision = pool
            .descriptor()
            .map(|d| self.policy.should_provision(d))
            .unwrap_or(false);
        if provision {
            if let Err(e) = self.provisioner.provision(key, pool.inner()).await {
                self.retire(pool);
                return Err(match e {
                    RoutingError::Migration { .. } => e,
                    other => RoutingError::migration(key, other.to_string()),
                });
            }
        } else {
            tracing::debug!(tenant = %key, "schema provisioning skipped ({:?} policy)", self.policy);
        }

        let previous = {
            let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
            // Checked under the map lock so a pool can never land after shutdown drained the map.
            if self.is_shut_down() {
                drop(pools);
                self.retire(pool);
                return Err(RoutingError::provisioning(key, "registry is shut down"));
            }
            pools.insert(key.to_string(), pool)
        };
        if let Some(old) = previous {
            tracing::info!(tenant = %key, "replacing tenant pool");
            self.retire(old);
        }
        tracing::info!(tenant = %key, "configured tenant");
        Ok(())
    }

    /// Unregisters a tenant and closes its pool once idle. The default tenant cannot be evicted.
    pub async fn evict(&self, key: &str) -> Result<(), RoutingError> {
        if key == DEFAULT_TENANT {
            return Err(RoutingError::Configuration("the default tenant cannot be evicted".into()));
        }
        let lock = self.admission_lock(key);
        let removed = {
            let _guard = lock.lock().await;
            self.pools
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(key)
        };
        self.release_admission_lock(key, lock);
        match removed {
            Some(pool) => {
                tracing::info!(tenant = %key, "evicted tenant");
                self.retire(pool);
                Ok(())
            }
            None => Err(RoutingError::TenantNotFound(key.to_string())),
        }
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Closes every pool, the default one included, waiting for checked-out connections.
    /// Later admissions are refused.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let pools: Vec<Arc<TenantPool<P>>> = self
            .pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, pool)| pool)
            .collect();
        futures::future::join_all(pools.iter().map(|p| p.close())).await;
        if !self.default_pool.is_closed() {
            self.default_pool.close().await;
        }

        let retiring: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.retiring.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in retiring {
            let _ = handle.await;
        }
        tracing::info!("all tenant pools closed");
    }

    fn admission_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.admission_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Drops the lock entry for `key` unless another admission holds or waits on it.
    fn release_admission_lock(&self, key: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.admission_locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One count for the map entry, one for `lock`.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }

    /// Closes `pool` in the background once no caller still holds it, so an operation that
    /// selected the pool before it was replaced can still check out a connection. `close`
    /// itself then waits for outstanding connections.
    fn retire(&self, pool: Arc<TenantPool<P>>) {
        let handle = tokio::spawn(async move {
            while Arc::strong_count(&pool) > 1 {
                tokio::time::sleep(RETIRE_POLL).await;
            }
            pool.close().await;
            tracing::debug!(tenant = %pool.key(), "retired pool closed");
        });
        let mut retiring = self.retiring.lock().unwrap_or_else(PoisonError::into_inner);
        retiring.retain(|h| !h.is_finished());
        retiring.push(handle);
    }
}
