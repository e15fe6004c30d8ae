//! Test environment wiring memory storage, a test clock, a mock callback
//! server and the production pipeline engine.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use herald_core::{
    storage::{Storage, StoreConfig},
    Clock, DocumentId, EventHandler, Resource, Subscription, TestClock,
};
use herald_delivery::{
    EngineStats, IngestOutcome, Ingestor, PipelineConfig, PipelineEngine, RedeliveryPolicy,
};
use serde_json::Value;

use crate::{
    events::RecordingEventHandler,
    fixtures::{ResourceBuilder, SubscriptionBuilder},
    http::MockServer,
};

/// Builder for [`TestEnv`].
#[derive(Debug, Clone)]
pub struct TestEnvBuilder {
    partition_limit: u32,
    pipeline: PipelineConfig,
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        Self {
            partition_limit: StoreConfig::default().partition_limit,
            pipeline: PipelineConfig {
                partition_workers: 1,
                spread_workers: 1,
                delivery_workers: 1,
                stage_deadline: Duration::from_secs(10),
                redelivery: RedeliveryPolicy {
                    max_attempts: 5,
                    base_delay: Duration::from_millis(10),
                    max_delay: Duration::from_millis(100),
                    jitter_factor: 0.0,
                },
                shutdown_timeout: Duration::from_secs(5),
                ..PipelineConfig::default()
            },
        }
    }
}

impl TestEnvBuilder {
    /// Creates a builder with test-friendly defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum subscriptions per partition.
    #[must_use]
    pub fn partition_limit(mut self, limit: u32) -> Self {
        self.partition_limit = limit;
        self
    }

    /// Sets the HTTP timeout used for callbacks.
    #[must_use]
    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.pipeline.client_config.timeout = timeout;
        self
    }

    /// Sets the queue redelivery policy.
    #[must_use]
    pub fn redelivery(mut self, policy: RedeliveryPolicy) -> Self {
        self.pipeline.redelivery = policy;
        self
    }

    /// Replaces the whole pipeline configuration.
    #[must_use]
    pub fn pipeline(mut self, config: PipelineConfig) -> Self {
        self.pipeline = config;
        self
    }

    /// Builds the environment. Workers are not started; drive the pipeline
    /// with [`TestEnv::run_until_idle`] or call [`TestEnv::start`].
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline configuration is invalid.
    pub async fn build(self) -> Result<TestEnv> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
            )
            .with_test_writer()
            .try_init();

        let clock = TestClock::new();
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let storage = Storage::memory(
            StoreConfig { partition_limit: self.partition_limit },
            clock_arc.clone(),
        );
        let events = RecordingEventHandler::new();
        let handler: Arc<dyn EventHandler> = events.clone();

        let engine = PipelineEngine::new(storage.clone(), self.pipeline, clock_arc, handler)
            .context("failed to create pipeline engine")?;

        Ok(TestEnv {
            http_mock: MockServer::start().await,
            clock,
            storage,
            events,
            engine: Some(engine),
        })
    }
}

/// Isolated environment for pipeline tests.
pub struct TestEnv {
    /// Mock callback server.
    pub http_mock: MockServer,
    /// Deterministic clock shared with storage and the ledger.
    pub clock: TestClock,
    storage: Storage,
    events: Arc<RecordingEventHandler>,
    engine: Option<PipelineEngine>,
}

impl TestEnv {
    /// Creates an environment with default settings.
    ///
    /// # Errors
    ///
    /// See [`TestEnvBuilder::build`].
    pub async fn new() -> Result<Self> {
        TestEnvBuilder::new().build().await
    }

    /// Starts configuring an environment.
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::new()
    }

    /// Repository handles.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Recorded notification events.
    pub fn events(&self) -> &RecordingEventHandler {
        &self.events
    }

    /// The pipeline engine.
    ///
    /// # Panics
    ///
    /// Panics after [`shutdown`](Self::shutdown).
    pub fn engine(&self) -> &PipelineEngine {
        self.engine.as_ref().expect("pipeline engine already shut down")
    }

    /// Ingestor feeding the engine.
    pub fn ingestor(&self) -> Ingestor {
        self.engine().ingestor()
    }

    /// Validates and registers a resource.
    ///
    /// # Errors
    ///
    /// Returns validation or storage failures.
    pub async fn create_resource(&self, builder: ResourceBuilder) -> Result<Resource> {
        let resource = builder.build();
        resource.validate()?;
        self.storage.resources.create(&resource).await?;
        Ok(resource)
    }

    /// Registers a resource under the default fixture address and path.
    ///
    /// # Errors
    ///
    /// Returns storage failures.
    pub async fn default_resource(&self) -> Result<Resource> {
        self.create_resource(ResourceBuilder::new()).await
    }

    /// Joins a partition, validates and stores a subscription.
    ///
    /// # Errors
    ///
    /// Returns validation or storage failures; the partition slot is
    /// released again if the subscription cannot be stored.
    pub async fn subscribe(&self, builder: SubscriptionBuilder) -> Result<Subscription> {
        let pinned = builder.has_partition();
        let mut subscription = builder.build();
        let resource = self.storage.resources.find_by_id(subscription.resource_id).await?;
        subscription.validate_against(&resource)?;

        if !pinned {
            subscription.partition = self.storage.resources.join_partition(resource.id).await?;
        }
        if let Err(error) = self.storage.subscriptions.create(&subscription).await {
            if !pinned {
                self.storage
                    .resources
                    .leave_partition(resource.id, subscription.partition)
                    .await?;
            }
            return Err(error.into());
        }
        Ok(subscription)
    }

    /// Subscribes the mock server's `path` to a resource.
    ///
    /// # Errors
    ///
    /// See [`subscribe`](Self::subscribe).
    pub async fn subscribe_mock(&self, resource: &Resource, path: &str) -> Result<Subscription> {
        self.subscribe(SubscriptionBuilder::new(resource.id, self.http_mock.endpoint_url(path)))
            .await
    }

    /// Ingests a JSON object snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if `content` is not an object or ingestion fails.
    pub async fn ingest(&self, uri: &str, content: Value) -> Result<IngestOutcome> {
        let Value::Object(content) = content else {
            anyhow::bail!("document content must be a JSON object");
        };
        Ok(self.ingestor().ingest(uri, content).await?)
    }

    /// Removes a document.
    ///
    /// # Errors
    ///
    /// Returns ingestion failures.
    pub async fn remove(&self, uri: &str) -> Result<()> {
        self.ingestor().remove(uri).await?;
        Ok(())
    }

    /// Current snapshot of a document.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown documents.
    pub async fn document_revision(&self, uri: &str) -> Result<i64> {
        Ok(self.storage.documents.find_by_id(&DocumentId::from(uri)).await?.revision)
    }

    /// Drains all ready messages through the pipeline on the test task.
    ///
    /// # Errors
    ///
    /// Returns queue failures.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let handled = self.engine().process_pending().await.context("pipeline drain failed")?;
        tracing::debug!(handled, "pipeline drained");
        Ok(handled)
    }

    /// Advances the clock, releases delayed redeliveries and drains again.
    ///
    /// # Errors
    ///
    /// Returns queue failures.
    pub async fn redeliver_after(&self, elapsed: Duration) -> Result<usize> {
        self.clock.advance(elapsed);
        self.engine().release_delayed();
        self.run_until_idle().await
    }

    /// Engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.engine().stats().await
    }

    /// Starts the background workers.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine was already started or shut down.
    pub async fn start(&mut self) -> Result<()> {
        let engine = self.engine.as_mut().context("pipeline engine already shut down")?;
        engine.start().await?;
        Ok(())
    }

    /// Stops the background workers.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers did not finish in time.
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(engine) = self.engine.take() {
            engine.shutdown().await?;
        }
        Ok(())
    }
}
