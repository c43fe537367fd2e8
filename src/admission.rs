//! Runtime admission of tenants by message passing.
//!
//! Whatever observes new descriptor rows (the admin API, the polling watcher) sends an
//! [`AdmissionCommand`] through an [`AdmissionHandle`]; the admission loop applies it to the
//! registry. Each command runs in its own task so a slow provisioning never holds up the queue.

use crate::error::RoutingError;
use crate::pool::ConnectionPool;
use crate::registry::TenantPoolRegistry;
use crate::tenant::TenantDescriptor;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Reply = oneshot::Sender<Result<(), RoutingError>>;

#[derive(Debug)]
pub enum AdmissionCommand {
    Admit {
        descriptor: TenantDescriptor,
        reply: Option<Reply>,
    },
    Evict {
        name: String,
        reply: Option<Reply>,
    },
}

#[derive(Clone, Debug)]
pub struct AdmissionHandle {
    tx: mpsc::Sender<AdmissionCommand>,
}

fn loop_stopped() -> RoutingError {
    RoutingError::Configuration("admission loop is not running".into())
}

impl AdmissionHandle {
    /// Admits `descriptor` and waits for the outcome.
    pub async fn admit(&self, descriptor: TenantDescriptor) -> Result<(), RoutingError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AdmissionCommand::Admit {
                descriptor,
                reply: Some(reply),
            })
            .await
            .map_err(|_| loop_stopped())?;
        rx.await.map_err(|_| loop_stopped())?
    }

    /// Queues an admission without waiting; failures are logged by the loop.
    pub async fn submit(&self, descriptor: TenantDescriptor) -> Result<(), RoutingError> {
        self.tx
            .send(AdmissionCommand::Admit {
                descriptor,
                reply: None,
            })
            .await
            .map_err(|_| loop_stopped())
    }

    pub async fn evict(&self, name: impl Into<String>) -> Result<(), RoutingError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AdmissionCommand::Evict {
                name: name.into(),
                reply: Some(reply),
            })
            .await
            .map_err(|_| loop_stopped())?;
        rx.await.map_err(|_| loop_stopped())?
    }
}

fn respond(reply: Option<Reply>, tenant: &str, result: Result<(), RoutingError>) {
    match reply {
        Some(reply) => {
            let _ = reply.send(result);
        }
        None => {
            if let Err(e) = result {
                tracing::error!(tenant = %tenant, "admission failed: {}", e);
            }
        }
    }
}

/// Starts the admission loop. It ends once every [`AdmissionHandle`] has been dropped.
pub fn spawn_admission_loop<P: ConnectionPool>(
    registry: Arc<TenantPoolRegistry<P>>,
    buffer: usize,
) -> (AdmissionHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<AdmissionCommand>(buffer.max(1));
    let task = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                match command {
                    AdmissionCommand::Admit { descriptor, reply } => {
                        let name = descriptor.name.clone();
                        let result = registry.admit(descriptor).await;
                        respond(reply, &name, result);
                    }
                    AdmissionCommand::Evict { name, reply } => {
                        let result = registry.evict(&name).await;
                        respond(reply, &name, result);
                    }
                }
            });
        }
        tracing::debug!("admission loop stopped");
    });
    (AdmissionHandle { tx }, task)
}

/// Read side of the tenant descriptor store.
#[async_trait]
pub trait TenantSource: Send + Sync {
    async fn find_all(&self) -> Result<Vec<TenantDescriptor>, RoutingError>;

    /// Descriptors whose id is greater than `id`, in id order.
    async fn find_created_after(&self, id: i64) -> Result<Vec<TenantDescriptor>, RoutingError>;
}

/// Polls `source` every `interval` for rows newer than `last_seen` and submits them for admission.
/// Stops when the admission loop is gone.
pub fn spawn_tenant_watcher<S>(
    source: Arc<S>,
    admission: AdmissionHandle,
    interval: Duration,
    mut last_seen: i64,
) -> JoinHandle<()>
where
    S: TenantSource + ?Sized + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let fresh = match source.find_created_after(last_seen).await {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!("tenant poll failed: {}", e);
                    continue;
                }
            };
            for descriptor in fresh {
                if let Some(id) = descriptor.id {
                    last_seen = last_seen.max(id);
                }
                tracing::info!(tenant = %descriptor.name, "new tenant found");
                if admission.submit(descriptor).await.is_err() {
                    tracing::debug!("tenant watcher stopped");
                    return;
                }
            }
        }
    })
}

/// Highest descriptor id in `descriptors`, or 0.
pub fn last_seen_id(descriptors: &[TenantDescriptor]) -> i64 {
    descriptors.iter().filter_map(|d| d.id).max().unwrap_or(0)
}
