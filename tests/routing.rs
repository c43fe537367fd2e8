//! End-to-end routing through the public API with in-memory pools.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tenant_router::{
    spawn_admission_loop, with_caller, CallerIdentity, ConnectionPool, ConnectionPoolFactory, ConnectionProvider,
    ConnectionRouter, ProvisionPolicy, RoutingError, SchemaProvisioner, TenantDescriptor, TenantPoolRegistry,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

struct FakeConnection {
    url: String,
    _permit: OwnedSemaphorePermit,
}

#[derive(Clone)]
struct FakePool {
    url: String,
    permits: Arc<Semaphore>,
}

impl FakePool {
    fn new(url: &str) -> Self {
        FakePool {
            url: url.to_string(),
            permits: Arc::new(Semaphore::new(4)),
        }
    }
}

#[async_trait]
impl ConnectionPool for FakePool {
    type Connection = FakeConnection;

    async fn acquire(&self) -> Result<FakeConnection, sqlx::Error> {
        match tokio::time::timeout(Duration::from_millis(100), self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(FakeConnection {
                url: self.url.clone(),
                _permit: permit,
            }),
            Ok(Err(_)) => Err(sqlx::Error::PoolClosed),
            Err(_) => Err(sqlx::Error::PoolTimedOut),
        }
    }

    async fn close(&self) {
        self.permits.close();
    }

    fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}

struct FakeFactory;

impl ConnectionPoolFactory<FakePool> for FakeFactory {
    fn create(&self, descriptor: &TenantDescriptor) -> Result<FakePool, RoutingError> {
        Ok(FakePool::new(&descriptor.url))
    }
}

#[derive(Default)]
struct CountingProvisioner {
    provisioned: Mutex<Vec<String>>,
}

#[async_trait]
impl SchemaProvisioner<FakePool> for CountingProvisioner {
    async fn provision(&self, tenant: &str, _pool: &FakePool) -> Result<(), RoutingError> {
        self.provisioned.lock().unwrap().push(tenant.to_string());
        Ok(())
    }
}

fn tenant(name: &str, id: i64) -> TenantDescriptor {
    TenantDescriptor::new(name, format!("db://{}", name), "app", "secret").with_id(id)
}

#[tokio::test]
async fn requests_route_to_their_tenant_database() {
    let provisioner = Arc::new(CountingProvisioner::default());
    let registry = Arc::new(TenantPoolRegistry::bootstrap(
        FakePool::new("db://main"),
        Arc::new(FakeFactory),
        provisioner.clone(),
        ProvisionPolicy::Flagged,
    ));
    let report = registry
        .load_all(vec![tenant("acme", 1), tenant("globex", 2).with_initialize(false)])
        .await;
    assert!(report.is_complete());
    assert_eq!(*provisioner.provisioned.lock().unwrap(), vec!["acme".to_string()]);

    let router = ConnectionRouter::new(Arc::clone(&registry));

    let acme = with_caller(CallerIdentity::for_tenant("acme"), router.acquire()).await.unwrap();
    assert_eq!(acme.url, "db://acme");
    let globex = with_caller(CallerIdentity::for_tenant("globex"), router.acquire()).await.unwrap();
    assert_eq!(globex.url, "db://globex");
    assert_eq!(router.acquire().await.unwrap().url, "db://main");
    let blank = with_caller(CallerIdentity::for_tenant("   "), router.acquire()).await.unwrap();
    assert_eq!(blank.url, "db://main");
}

#[tokio::test]
async fn tenant_admitted_at_runtime_becomes_routable() {
    let registry = Arc::new(TenantPoolRegistry::bootstrap(
        FakePool::new("db://main"),
        Arc::new(FakeFactory),
        Arc::new(CountingProvisioner::default()),
        ProvisionPolicy::Always,
    ));
    let router = ConnectionRouter::new(Arc::clone(&registry));
    let (admission, _loop) = spawn_admission_loop(Arc::clone(&registry), 4);

    let before = with_caller(CallerIdentity::for_tenant("initech"), router.acquire()).await.unwrap();
    assert_eq!(before.url, "db://main");

    admission.admit(tenant("initech", 7)).await.unwrap();
    let after = with_caller(CallerIdentity::for_tenant("initech"), router.acquire()).await.unwrap();
    assert_eq!(after.url, "db://initech");

    admission.evict("initech").await.unwrap();
    let evicted = with_caller(CallerIdentity::for_tenant("initech"), router.acquire()).await.unwrap();
    assert_eq!(evicted.url, "db://main");
}
