//! In-memory pools, factory and provisioner used by unit tests.

use crate::error::RoutingError;
use crate::migration::SchemaProvisioner;
use crate::pool::{ConnectionPool, ConnectionPoolFactory};
use crate::tenant::TenantDescriptor;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug)]
pub struct MemoryConnection {
    pub url: String,
    _permit: OwnedSemaphorePermit,
}

#[derive(Clone)]
pub struct MemoryPool {
    pub url: String,
    size: u32,
    timeout: Duration,
    permits: Arc<Semaphore>,
    closing: Arc<AtomicBool>,
    drained: Arc<AtomicBool>,
}

impl MemoryPool {
    pub fn new(url: impl Into<String>, size: u32, timeout: Duration) -> Self {
        MemoryPool {
            url: url.into(),
            size,
            timeout,
            permits: Arc::new(Semaphore::new(size as usize)),
            closing: Arc::new(AtomicBool::new(false)),
            drained: Arc::new(AtomicBool::new(false)),
        }
    }

    /// True once `close` has finished waiting for outstanding connections.
    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::SeqCst)
    }

    pub async fn wait_drained(&self) -> bool {
        for _ in 0..200 {
            if self.is_drained() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }
}

#[async_trait]
impl ConnectionPool for MemoryPool {
    type Connection = MemoryConnection;

    async fn acquire(&self) -> Result<MemoryConnection, sqlx::Error> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(sqlx::Error::PoolClosed);
        }
        match tokio::time::timeout(self.timeout, self.permits.clone().acquire_owned()).await {
            Err(_) => Err(sqlx::Error::PoolTimedOut),
            Ok(Err(_)) => Err(sqlx::Error::PoolClosed),
            Ok(Ok(permit)) => Ok(MemoryConnection {
                url: self.url.clone(),
                _permit: permit,
            }),
        }
    }

    async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Ok(all) = self.permits.acquire_many(self.size).await {
            all.forget();
        }
        self.permits.close();
        self.drained.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

/// Builds [`MemoryPool`]s and keeps a handle on every pool it built.
pub struct MemoryFactory {
    pub size: u32,
    pub timeout: Duration,
    pub built: Mutex<Vec<MemoryPool>>,
}

impl MemoryFactory {
    pub fn new() -> Self {
        MemoryFactory {
            size: 2,
            timeout: Duration::from_millis(100),
            built: Mutex::new(Vec::new()),
        }
    }

    pub fn built(&self) -> Vec<MemoryPool> {
        self.built.lock().unwrap().clone()
    }
}

impl ConnectionPoolFactory<MemoryPool> for MemoryFactory {
    fn create(&self, descriptor: &TenantDescriptor) -> Result<MemoryPool, RoutingError> {
        if descriptor.url.trim().is_empty() {
            return Err(RoutingError::provisioning(&descriptor.name, "url is blank"));
        }
        let pool = MemoryPool::new(descriptor.url.clone(), self.size, self.timeout);
        self.built.lock().unwrap().push(pool.clone());
        Ok(pool)
    }
}

/// Counts provisioning runs per tenant; can fail or stall selected tenants.
#[derive(Default)]
pub struct RecordingProvisioner {
    pub failing: HashSet<String>,
    pub delays: HashMap<String, Duration>,
    pub runs: Mutex<HashMap<String, usize>>,
}

impl RecordingProvisioner {
    pub fn failing(tenant: &str) -> Self {
        RecordingProvisioner {
            failing: [tenant.to_string()].into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn slow(tenant: &str, delay: Duration) -> Self {
        RecordingProvisioner {
            delays: [(tenant.to_string(), delay)].into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn runs(&self, tenant: &str) -> usize {
        self.runs.lock().unwrap().get(tenant).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SchemaProvisioner<MemoryPool> for RecordingProvisioner {
    async fn provision(&self, tenant: &str, _pool: &MemoryPool) -> Result<(), RoutingError> {
        if let Some(delay) = self.delays.get(tenant) {
            tokio::time::sleep(*delay).await;
        }
        *self.runs.lock().unwrap().entry(tenant.to_string()).or_default() += 1;
        if self.failing.contains(tenant) {
            return Err(RoutingError::migration(tenant, "changelog rejected"));
        }
        Ok(())
    }
}

pub fn descriptor(name: &str, id: i64) -> TenantDescriptor {
    TenantDescriptor::new(name, format!("db://{}", name), "u", "p").with_id(id)
}
