//! Partition stage: one spread message per partition of the resource.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use herald_core::storage::Storage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::{
    fanout::TaskGroup,
    messages::{self, PartitionMessage},
    spread::SpreadStage,
    within_deadline,
};
use crate::{
    error::Result,
    queue::{MessageHandler, Queue},
};

/// Fans a change out to the partitions of its resource.
#[derive(Debug, Clone)]
pub struct PartitionStage {
    storage: Storage,
    spread_queue: Arc<dyn Queue>,
    concurrency: usize,
    deadline: Duration,
    cancel: CancellationToken,
}

impl PartitionStage {
    /// Creates the stage.
    pub fn new(
        storage: Storage,
        spread_queue: Arc<dyn Queue>,
        concurrency: usize,
        deadline: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self { storage, spread_queue, concurrency, deadline, cancel }
    }

    /// Enqueues a change for partitioning.
    ///
    /// # Errors
    ///
    /// Returns queue or serialization failures.
    pub async fn push(queue: &dyn Queue, message: &PartitionMessage) -> Result<()> {
        queue.push(messages::encode(message)?).await
    }

    /// Pushes one spread message per partition, returning how many.
    ///
    /// A resource that no longer exists is skipped. The first failed push
    /// cancels the remaining ones and fails the call.
    ///
    /// # Errors
    ///
    /// Returns storage or queue failures.
    #[instrument(
        skip(self, message),
        fields(
            document_id = %message.document_id,
            resource_id = %message.resource_id,
            action = %message.action,
        )
    )]
    pub async fn process(&self, message: PartitionMessage) -> Result<usize> {
        let partitions = match self.storage.resources.partitions(message.resource_id).await {
            Ok(partitions) => partitions,
            Err(error) if error.is_not_found() => {
                debug!("resource vanished, skipping change");
                return Ok(0);
            },
            Err(error) => return Err(error.into()),
        };

        let mut group = TaskGroup::new(self.concurrency, &self.cancel);
        for partition in partitions {
            let queue = self.spread_queue.clone();
            let next = message.spread(partition);
            group.spawn(async move { SpreadStage::push(queue.as_ref(), &next).await }).await?;
        }

        let pushed = group.spawned();
        group.wait().await?;
        debug!(partitions = pushed, "change partitioned");
        Ok(pushed)
    }
}

#[async_trait]
impl MessageHandler for PartitionStage {
    async fn handle(&self, payload: Bytes) -> Result<()> {
        let message: PartitionMessage = messages::decode(&payload)?;
        within_deadline("partition", self.deadline, self.process(message)).await.map(|_| ())
    }
}
