//! Pipeline engine wiring queues, stages and workers together.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────────┐   ┌──────────────┐   ┌────────────────┐
//! │ Ingestor │──▶│ partition queue │──▶│ spread queue │──▶│ delivery queue │
//! └──────────┘   └─────────────────┘   └──────────────┘   └────────────────┘
//!                        │                     │                   │
//!                        ▼                     ▼                   ▼
//!                 partition workers      spread workers     delivery workers
//! ```
//!
//! Each queue has its own worker set. Shutdown cancels the workers, lets
//! in-flight messages finish within the configured timeout and leaves the
//! rest on the queues.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use herald_core::{
    storage::Storage, Clock, EventHandler, MulticastEventHandler, NotificationEvent,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    client::{ClientConfig, DeliveryClient},
    error::{DeliveryError, Result},
    pipeline::{DeliveryStage, Ingestor, PartitionStage, SpreadStage},
    queue::{MemoryQueue, MessageHandler, Queue, QueueStats},
    retry::RedeliveryPolicy,
    worker_pool::WorkerPool,
};

/// Configuration for the pipeline engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Workers pulling from the partition queue.
    pub partition_workers: usize,

    /// Workers pulling from the spread queue.
    pub spread_workers: usize,

    /// Workers pulling from the delivery queue.
    pub delivery_workers: usize,

    /// Concurrent pushes while fanning out to partitions.
    pub partition_concurrency: usize,

    /// Concurrent pushes while fanning out to subscriptions.
    pub spread_concurrency: usize,

    /// Deadline for one stage invocation.
    pub stage_deadline: Duration,

    /// Maximum messages held by each queue.
    pub queue_capacity: usize,

    /// Redelivery policy shared by all queues.
    pub redelivery: RedeliveryPolicy,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Maximum time to wait for in-flight messages on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            partition_workers: crate::DEFAULT_WORKER_COUNT,
            spread_workers: crate::DEFAULT_WORKER_COUNT,
            delivery_workers: crate::DEFAULT_WORKER_COUNT * 4,
            partition_concurrency: crate::DEFAULT_FANOUT_CONCURRENCY,
            spread_concurrency: crate::DEFAULT_FANOUT_CONCURRENCY,
            stage_deadline: Duration::from_secs(crate::DEFAULT_STAGE_DEADLINE_SECONDS),
            queue_capacity: 10_000,
            redelivery: RedeliveryPolicy::default(),
            client_config: ClientConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    /// Checks the settings that would otherwise stall or panic at runtime.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.partition_concurrency == 0 || self.spread_concurrency == 0 {
            return Err(DeliveryError::configuration("fan-out concurrency must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(DeliveryError::configuration("queue capacity must be at least 1"));
        }
        if self.stage_deadline.is_zero() {
            return Err(DeliveryError::configuration("stage deadline must be positive"));
        }
        if self.redelivery.max_attempts == 0 {
            return Err(DeliveryError::configuration("redelivery needs at least one attempt"));
        }
        if self.redelivery.base_delay > self.redelivery.max_delay {
            return Err(DeliveryError::configuration(
                "redelivery base delay exceeds its maximum delay",
            ));
        }
        if !(0.0..=1.0).contains(&self.redelivery.jitter_factor) {
            return Err(DeliveryError::configuration("jitter factor must be within 0.0..=1.0"));
        }
        Ok(())
    }
}

/// Statistics for pipeline monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Number of running stage workers.
    pub active_workers: usize,
    /// Stage messages handled by workers since startup.
    pub messages_processed: u64,
    /// Stage messages whose handler failed.
    pub messages_failed: u64,
    /// Stage messages currently being handled.
    pub in_flight: u64,
    /// Notifications answered with a success code.
    pub notifications_delivered: u64,
    /// Notifications answered with a discard code.
    pub notifications_discarded: u64,
    /// Notifications that failed.
    pub notifications_failed: u64,
    /// Ledger decisions that needed no callback.
    pub notifications_skipped: u64,
}

/// Depths of the three stage queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineQueueStats {
    /// Partition queue.
    pub partition: QueueStats,
    /// Spread queue.
    pub spread: QueueStats,
    /// Delivery queue.
    pub delivery: QueueStats,
}

/// Counts notification outcomes into [`EngineStats`].
#[derive(Debug)]
struct StatsRecorder {
    stats: Arc<RwLock<EngineStats>>,
}

#[async_trait]
impl EventHandler for StatsRecorder {
    async fn handle_event(&self, event: NotificationEvent) {
        let mut stats = self.stats.write().await;
        match event {
            NotificationEvent::Delivered(_) => stats.notifications_delivered += 1,
            NotificationEvent::Discarded(_) => stats.notifications_discarded += 1,
            NotificationEvent::Failed { .. } => stats.notifications_failed += 1,
            NotificationEvent::Skipped { .. } => stats.notifications_skipped += 1,
        }
    }
}

/// Main engine running the partition, spread and delivery stages.
pub struct PipelineEngine {
    storage: Storage,
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    partition_queue: Arc<MemoryQueue>,
    spread_queue: Arc<MemoryQueue>,
    delivery_queue: Arc<MemoryQueue>,
    partition: Arc<PartitionStage>,
    spread: Arc<SpreadStage>,
    delivery: Arc<DeliveryStage>,
    stats: Arc<RwLock<EngineStats>>,
    fanout_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
}

impl PipelineEngine {
    /// Creates the engine; no workers run until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for invalid settings or an HTTP client that
    /// cannot be built.
    pub fn new(
        storage: Storage,
        config: PipelineConfig,
        clock: Arc<dyn Clock>,
        event_handler: Arc<dyn EventHandler>,
    ) -> Result<Self> {
        config.validate()?;

        let client = Arc::new(DeliveryClient::new(config.client_config.clone())?);
        let stats = Arc::new(RwLock::new(EngineStats::default()));
        let fanout_token = CancellationToken::new();

        let mut events = MulticastEventHandler::new();
        events.add_subscriber(Arc::new(StatsRecorder { stats: stats.clone() }));
        events.add_subscriber(event_handler);
        let events: Arc<dyn EventHandler> = Arc::new(events);

        let queue = |name| {
            Arc::new(MemoryQueue::new(name, config.queue_capacity, config.redelivery.clone()))
        };
        let partition_queue = queue("partition");
        let spread_queue = queue("spread");
        let delivery_queue = queue("delivery");

        let partition = Arc::new(PartitionStage::new(
            storage.clone(),
            spread_queue.clone(),
            config.partition_concurrency,
            config.stage_deadline,
            fanout_token.clone(),
        ));
        let spread = Arc::new(SpreadStage::new(
            storage.clone(),
            delivery_queue.clone(),
            config.spread_concurrency,
            config.stage_deadline,
            fanout_token.clone(),
        ));
        let delivery = Arc::new(DeliveryStage::new(
            storage.clone(),
            client,
            events,
            clock.clone(),
            config.stage_deadline,
        ));

        Ok(Self {
            storage,
            config,
            clock,
            partition_queue,
            spread_queue,
            delivery_queue,
            partition,
            spread,
            delivery,
            stats,
            fanout_token,
            worker_pool: None,
        })
    }

    /// Ingestor feeding this engine's partition queue.
    pub fn ingestor(&self) -> Ingestor {
        Ingestor::new(self.storage.clone(), self.partition_queue.clone(), self.clock.clone())
    }

    /// Storage the engine reads from.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Starts the stage workers.
    ///
    /// Returns immediately after spawning. Use [`shutdown`](Self::shutdown)
    /// to stop gracefully.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if already started or a stage has no workers.
    pub async fn start(&mut self) -> Result<()> {
        if self.worker_pool.is_some() {
            return Err(DeliveryError::configuration("pipeline engine already started"));
        }

        info!(
            partition_workers = self.config.partition_workers,
            spread_workers = self.config.spread_workers,
            delivery_workers = self.config.delivery_workers,
            "starting change-trigger pipeline"
        );

        let mut pool = WorkerPool::new(self.stats.clone(), CancellationToken::new());
        pool.spawn_workers(
            "partition",
            self.config.partition_workers,
            self.partition_queue.clone(),
            self.partition.clone(),
        )
        .await?;
        pool.spawn_workers(
            "spread",
            self.config.spread_workers,
            self.spread_queue.clone(),
            self.spread.clone(),
        )
        .await?;
        pool.spawn_workers(
            "delivery",
            self.config.delivery_workers,
            self.delivery_queue.clone(),
            self.delivery.clone(),
        )
        .await?;

        self.worker_pool = Some(pool);
        Ok(())
    }

    /// Whether workers are running.
    pub fn is_running(&self) -> bool {
        self.worker_pool.as_ref().is_some_and(WorkerPool::has_active_workers)
    }

    /// Stops the workers, waiting up to the configured shutdown timeout
    /// for in-flight messages.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers did not finish in time.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down change-trigger pipeline");

        let result = match self.worker_pool.take() {
            Some(pool) => pool.shutdown_graceful(self.config.shutdown_timeout).await,
            None => Ok(()),
        };
        self.fanout_token.cancel();

        let queues = self.queue_stats();
        info!(
            partition_pending = queues.partition.ready + queues.partition.delayed,
            spread_pending = queues.spread.ready + queues.spread.delayed,
            delivery_pending = queues.delivery.ready + queues.delivery.delayed,
            "change-trigger pipeline stopped"
        );
        result
    }

    /// Current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Current queue depths.
    pub fn queue_stats(&self) -> PipelineQueueStats {
        PipelineQueueStats {
            partition: self.partition_queue.stats(),
            spread: self.spread_queue.stats(),
            delivery: self.delivery_queue.stats(),
        }
    }

    /// Whether every queue is empty with nothing in flight or delayed.
    pub fn is_idle(&self) -> bool {
        self.partition_queue.is_idle()
            && self.spread_queue.is_idle()
            && self.delivery_queue.is_idle()
    }

    /// Drains every ready message through the stages on the calling task,
    /// returning how many messages were handled.
    ///
    /// Delayed redeliveries stay delayed; use
    /// [`release_delayed`](Self::release_delayed) first to include them.
    /// Intended for tests and one-shot tools that run without workers.
    ///
    /// # Errors
    ///
    /// Returns queue failures. Handler failures follow the redelivery
    /// policy and are not returned.
    pub async fn process_pending(&self) -> Result<usize> {
        let stages: [(&MemoryQueue, &dyn MessageHandler); 3] = [
            (self.partition_queue.as_ref(), self.partition.as_ref()),
            (self.spread_queue.as_ref(), self.spread.as_ref()),
            (self.delivery_queue.as_ref(), self.delivery.as_ref()),
        ];

        let mut handled = 0;
        loop {
            let mut progressed = false;
            for (queue, handler) in stages {
                while queue.pull_ready(handler).await? {
                    handled += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return Ok(handled);
            }
        }
    }

    /// Makes every delayed redelivery ready now, returning how many.
    pub fn release_delayed(&self) -> usize {
        self.partition_queue.release_delayed()
            + self.spread_queue.release_delayed()
            + self.delivery_queue.release_delayed()
    }

    /// Partition queue, for producers outside the ingestor.
    pub fn partition_queue(&self) -> Arc<dyn Queue> {
        self.partition_queue.clone()
    }
}

impl Drop for PipelineEngine {
    fn drop(&mut self) {
        self.fanout_token.cancel();
    }
}
