//! Bounded reconciler worker pool.
//!
//! A fixed number of workers pull from the shared [`WorkQueue`], so at most
//! `size` deployments are ever between claim and terminal status. A separate
//! sweeper task fails deployments whose claim expired without renewal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use railyard_id::{DeploymentId, WorkerId};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use super::queue::WorkQueue;
use super::reconciler::Reconciler;
use crate::cancel::GroupToken;
use crate::db::{Store, StoreError};

/// Fixed-size pool of reconciler workers.
pub struct WorkerPool {
    queue: Arc<WorkQueue>,
    size: usize,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl WorkerPool {
    /// Spawns `size` workers plus the claim sweeper.
    pub fn start(
        size: usize,
        queue: Arc<WorkQueue>,
        reconciler: Arc<Reconciler>,
        store: Arc<dyn Store>,
        sweep_interval: Duration,
    ) -> Self {
        let size = size.max(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut handles = Vec::with_capacity(size + 1);
        for _ in 0..size {
            let worker = Worker {
                id: WorkerId::new(),
                queue: queue.clone(),
                reconciler: reconciler.clone(),
            };
            handles.push(tokio::spawn(worker.run(shutdown_rx.clone())));
        }

        let sweeper = ClaimSweeper {
            store,
            queue: queue.clone(),
            interval: sweep_interval,
        };
        handles.push(tokio::spawn(sweeper.run(shutdown_rx)));

        info!(workers = size, "Worker pool started");
        Self {
            queue,
            size,
            shutdown_tx,
            handles: Mutex::new(handles),
            running: AtomicBool::new(true),
        }
    }

    /// Dispatches a deployment to the pool.
    pub async fn submit(
        &self,
        deployment_id: DeploymentId,
        token: GroupToken,
    ) -> Result<(), StoreError> {
        self.queue.enqueue(deployment_id, token).await
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops every worker and waits for them to exit.
    ///
    /// In-flight reconciles are dropped; their claims stay in the store and
    /// are failed as lost when the engine starts again.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("Worker pool stopped");
    }
}

struct Worker {
    id: WorkerId,
    queue: Arc<WorkQueue>,
    reconciler: Arc<Reconciler>,
}

impl Worker {
    #[instrument(skip_all, fields(worker_id = %self.id))]
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting reconciler worker");

        loop {
            let item = tokio::select! {
                item = self.queue.next() => match item {
                    Some(item) => item,
                    None => break,
                },
                _ = shutdown_requested(&mut shutdown) => break,
            };

            let deployment_id = item.deployment_id;
            tokio::select! {
                result = self.reconciler.run(self.id, item) => {
                    if let Err(e) = result {
                        error!(deployment_id = %deployment_id, error = %e, "Reconcile aborted by store error");
                    }
                }
                _ = shutdown_requested(&mut shutdown) => {
                    warn!(deployment_id = %deployment_id, "Shutdown interrupted reconcile");
                    break;
                }
            }
        }

        info!("Reconciler worker shutting down");
    }
}

/// Fails deployments whose claims expired.
struct ClaimSweeper {
    store: Arc<dyn Store>,
    queue: Arc<WorkQueue>,
    interval: Duration,
}

impl ClaimSweeper {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Claim sweep failed");
                    }
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
    }

    async fn sweep(&self) -> Result<(), StoreError> {
        let expired = self.store.expired_claims(Utc::now()).await?;
        if expired.is_empty() {
            return Ok(());
        }
        let failed = self.queue.fail_lost(expired, "claim expired").await;
        info!(failed, "Swept expired claims");
        Ok(())
    }
}

/// Resolves once shutdown is signalled or the pool is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
