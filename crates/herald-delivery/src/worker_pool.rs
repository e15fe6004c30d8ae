//! Worker pool management with structured concurrency.
//!
//! Provides lifecycle management and graceful shutdown for the stage
//! workers of all three queues.

use std::{sync::Arc, time::Duration};

use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    engine::EngineStats,
    error::{DeliveryError, Result},
    queue::{MessageHandler, Queue},
    worker::StageWorker,
};

/// Supervised set of stage workers sharing one cancellation token.
pub struct WorkerPool {
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<(&'static str, JoinHandle<Result<()>>)>,
}

impl WorkerPool {
    /// Creates an empty pool.
    pub fn new(stats: Arc<RwLock<EngineStats>>, cancellation_token: CancellationToken) -> Self {
        Self { stats, cancellation_token, worker_handles: Vec::new() }
    }

    /// Spawns `count` workers pulling from `queue` into `handler`.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` when `count` is zero, since the stage would
    /// never drain.
    pub async fn spawn_workers(
        &mut self,
        stage: &'static str,
        count: usize,
        queue: Arc<dyn Queue>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        if count == 0 {
            return Err(DeliveryError::configuration(format!("{stage} stage needs workers")));
        }

        info!(stage, worker_count = count, "spawning stage workers");
        self.stats.write().await.active_workers += count;

        for worker_id in 0..count {
            let worker = StageWorker::new(
                worker_id,
                stage,
                queue.clone(),
                handler.clone(),
                self.stats.clone(),
                self.cancellation_token.clone(),
            );

            let handle = tokio::spawn(async move {
                info!(worker_id, stage, "stage worker starting");

                let result = worker.run().await;

                if let Err(ref error) = result {
                    error!(worker_id, stage, error = %error, "stage worker terminated with error");
                } else {
                    info!(worker_id, stage, "stage worker stopped gracefully");
                }

                result
            });

            self.worker_handles.push((stage, handle));
        }

        Ok(())
    }

    /// Number of spawned workers.
    pub fn worker_count(&self) -> usize {
        self.worker_handles.len()
    }

    /// Check if any workers are still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|(_, h)| !h.is_finished())
    }

    /// Cancels all workers and waits for in-flight messages to finish.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers are still busy after `timeout`.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let stats = self.stats.clone();
        let shutdown_future = async move {
            let mut panics = 0;

            for (worker_id, (stage, handle)) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(worker_id, stage, error = %error, "worker completed with error during shutdown");
                    },
                    Err(join_error) => {
                        error!(worker_id, stage, error = %join_error, "worker task panicked during shutdown");
                        panics += 1;
                    },
                }
            }

            stats.write().await.active_workers = 0;
            panics
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(panics) => {
                if panics > 0 {
                    warn!(panics, "some workers panicked during shutdown");
                }
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_timeout) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active_count = self.worker_handles.iter().filter(|(_, h)| !h.is_finished()).count();

        if active_count > 0 && !self.cancellation_token.is_cancelled() {
            error!(
                active_workers = active_count,
                "WorkerPool dropped with {} active workers, forcing cancellation", active_count
            );
            self.cancellation_token.cancel();
            warn!("call shutdown_graceful() before dropping the pool to finish in-flight messages");
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::{queue::MemoryQueue, retry::RedeliveryPolicy};

    struct Slow(Duration);

    #[async_trait]
    impl MessageHandler for Slow {
        async fn handle(&self, _payload: Bytes) -> Result<()> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    fn queue() -> Arc<MemoryQueue> {
        Arc::new(MemoryQueue::new("test", 8, RedeliveryPolicy::default()))
    }

    #[tokio::test]
    async fn pool_spawns_and_shuts_down() {
        let stats = Arc::new(RwLock::new(EngineStats::default()));
        let mut pool = WorkerPool::new(stats.clone(), CancellationToken::new());

        pool.spawn_workers("partition", 2, queue(), Arc::new(Slow(Duration::ZERO))).await.unwrap();
        pool.spawn_workers("spread", 3, queue(), Arc::new(Slow(Duration::ZERO))).await.unwrap();
        assert_eq!(pool.worker_count(), 5);
        assert_eq!(stats.read().await.active_workers, 5);

        pool.shutdown_graceful(Duration::from_secs(1)).await.unwrap();
        assert_eq!(stats.read().await.active_workers, 0);
    }

    #[tokio::test]
    async fn zero_workers_rejected() {
        let mut pool =
            WorkerPool::new(Arc::new(RwLock::new(EngineStats::default())), CancellationToken::new());

        let error = pool
            .spawn_workers("delivery", 0, queue(), Arc::new(Slow(Duration::ZERO)))
            .await
            .unwrap_err();
        assert!(matches!(error, DeliveryError::Configuration { .. }));
    }

    #[tokio::test]
    async fn in_flight_message_finishes_before_shutdown() {
        let stats = Arc::new(RwLock::new(EngineStats::default()));
        let mut pool = WorkerPool::new(stats.clone(), CancellationToken::new());
        let queue = queue();
        queue.push(Bytes::from("a")).await.unwrap();

        pool.spawn_workers("delivery", 1, queue.clone(), Arc::new(Slow(Duration::from_millis(100))))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.shutdown_graceful(Duration::from_secs(2)).await.unwrap();
        assert!(queue.is_idle());
        assert_eq!(stats.read().await.messages_processed, 1);
    }

    #[tokio::test]
    async fn shutdown_times_out_on_stuck_worker() {
        let mut pool =
            WorkerPool::new(Arc::new(RwLock::new(EngineStats::default())), CancellationToken::new());
        let queue = queue();
        queue.push(Bytes::from("a")).await.unwrap();

        pool.spawn_workers("delivery", 1, queue, Arc::new(Slow(Duration::from_secs(30))))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let error = pool.shutdown_graceful(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(error, DeliveryError::ShutdownTimeout { .. }));
    }
}
