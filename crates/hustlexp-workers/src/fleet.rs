//! Worker trait, the shared drive loop, and the fleet supervisor.

use crate::error::WorkerError;
use chrono::Utc;
use hustlexp_outbox::OutboxConsumer;
use hustlexp_storage::OutboxRecord;
use hustlexp_types::Queue;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{error, info};

/// One worker type per queue; all share the claim/ack discipline.
#[async_trait::async_trait]
pub trait QueueWorker: Send + Sync {
    fn queue(&self) -> Queue;

    /// Process one delivery. Must be idempotent: re-delivery of any event
    /// produces the same end state as the first delivery.
    async fn handle(&self, record: &OutboxRecord) -> Result<(), WorkerError>;
}

/// One claim-process-ack pass. Retryable failures reschedule with backoff;
/// everything else dead-letters immediately. Returns processed count.
pub async fn run_once(
    worker: &dyn QueueWorker,
    consumer: &OutboxConsumer,
) -> Result<usize, WorkerError> {
    let now = Utc::now();
    let claimed = consumer.claim(now).await?;
    let mut processed = 0;
    for record in &claimed {
        match worker.handle(record).await {
            Ok(()) => {
                consumer.ack(record.id).await?;
                processed += 1;
            }
            Err(err) if err.is_retryable() => {
                consumer.nack(record, &err.to_string(), now).await?;
            }
            Err(err) => {
                consumer.fail_fatal(record, &err.to_string()).await?;
            }
        }
    }
    Ok(processed)
}

/// Fleet tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct FleetConfig {
    pub poll_interval: Duration,
    /// Identical consumers per queue; the atomic claim keeps them disjoint.
    pub workers_per_queue: usize,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            workers_per_queue: 1,
        }
    }
}

/// Supervisor for spawned worker loops with watch-channel shutdown.
pub struct WorkerFleet {
    config: FleetConfig,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerFleet {
    pub fn new(config: FleetConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// Spawn the configured number of loops driving `worker` against its
    /// queue.
    pub fn spawn_queue_worker<W, F>(&mut self, name: &'static str, worker: Arc<W>, consumer: F)
    where
        W: QueueWorker + 'static,
        F: Fn() -> OutboxConsumer,
    {
        for replica in 0..self.config.workers_per_queue {
            let worker = worker.clone();
            let consumer = consumer();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            let poll = self.config.poll_interval;
            self.handles.push(tokio::spawn(async move {
                let mut ticker = interval(poll);
                info!(worker = name, replica, "worker loop started");
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(err) = run_once(worker.as_ref(), &consumer).await {
                                error!(worker = name, error = %err, "worker pass failed");
                            }
                            if let Err(err) = consumer.reclaim_leases(Utc::now()).await {
                                error!(worker = name, error = %err, "lease reclaim failed");
                            }
                        }
                        _ = shutdown_rx.changed() => break,
                    }
                }
                info!(worker = name, replica, "worker loop stopped");
            }));
        }
    }

    /// Spawn a periodic job (sweeps, reapers) on its own cadence.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &'static str, every: Duration, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), WorkerError>> + Send,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.handles.push(tokio::spawn(async move {
            let mut ticker = interval(every);
            info!(job = name, "periodic job started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = job().await {
                            error!(job = name, error = %err, "periodic job failed");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            info!(job = name, "periodic job stopped");
        }));
    }

    /// Signal shutdown and wait for every loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
