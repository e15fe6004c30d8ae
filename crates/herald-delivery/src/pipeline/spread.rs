//! Spread stage: one delivery message per subscription in a partition.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use herald_core::storage::Storage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::{
    delivery::DeliveryStage,
    fanout::TaskGroup,
    messages::{self, SpreadMessage},
    within_deadline,
};
use crate::{
    error::Result,
    queue::{MessageHandler, Queue},
};

/// Fans a partitioned change out to the partition's subscriptions.
#[derive(Debug, Clone)]
pub struct SpreadStage {
    storage: Storage,
    delivery_queue: Arc<dyn Queue>,
    concurrency: usize,
    deadline: Duration,
    cancel: CancellationToken,
}

impl SpreadStage {
    /// Creates the stage.
    pub fn new(
        storage: Storage,
        delivery_queue: Arc<dyn Queue>,
        concurrency: usize,
        deadline: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self { storage, delivery_queue, concurrency, deadline, cancel }
    }

    /// Enqueues a change for one partition.
    ///
    /// # Errors
    ///
    /// Returns queue or serialization failures.
    pub async fn push(queue: &dyn Queue, message: &SpreadMessage) -> Result<()> {
        queue.push(messages::encode(message)?).await
    }

    /// Streams the partition's subscriptions and pushes a delivery message
    /// for each, returning how many.
    ///
    /// Subscriptions are pushed while the stream is still being read, so
    /// large partitions never sit in memory at once.
    ///
    /// # Errors
    ///
    /// A stream error or failed push aborts the whole invocation.
    #[instrument(
        skip(self, message),
        fields(
            document_id = %message.document_id,
            resource_id = %message.resource_id,
            partition = %message.partition,
            action = %message.action,
        )
    )]
    pub async fn process(&self, message: SpreadMessage) -> Result<usize> {
        let mut stream = self
            .storage
            .subscriptions
            .find_by_partition(message.resource_id, message.partition)
            .await?;

        let mut group = TaskGroup::new(self.concurrency, &self.cancel);
        while let Some(item) = stream.recv().await {
            let subscription = item?;
            let queue = self.delivery_queue.clone();
            let next = message.deliver(subscription.id);
            group.spawn(async move { DeliveryStage::push(queue.as_ref(), &next).await }).await?;
        }

        let pushed = group.spawned();
        group.wait().await?;
        debug!(subscriptions = pushed, "partition spread");
        Ok(pushed)
    }
}

#[async_trait]
impl MessageHandler for SpreadStage {
    async fn handle(&self, payload: Bytes) -> Result<()> {
        let message: SpreadMessage = messages::decode(&payload)?;
        within_deadline("spread", self.deadline, self.process(message)).await.map(|_| ())
    }
}
