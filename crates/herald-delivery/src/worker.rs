//! Stage worker: pulls messages from one queue until cancelled.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    engine::EngineStats,
    error::Result,
    queue::{MessageHandler, Queue},
};

/// Pause after a queue failure before pulling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Individual worker bound to one stage queue.
pub struct StageWorker {
    id: usize,
    stage: &'static str,
    queue: Arc<dyn Queue>,
    handler: Arc<dyn MessageHandler>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
}

impl StageWorker {
    /// Creates a worker for `stage`.
    pub fn new(
        id: usize,
        stage: &'static str,
        queue: Arc<dyn Queue>,
        handler: Arc<dyn MessageHandler>,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { id, stage, queue, handler, stats, cancellation_token }
    }

    /// Main worker loop: handles one message at a time until cancelled.
    ///
    /// A message already being handled when cancellation fires is finished
    /// first.
    ///
    /// # Errors
    ///
    /// Queue failures are logged and retried; the loop itself does not fail.
    pub async fn run(&self) -> Result<()> {
        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, stage = self.stage, "stage worker received shutdown signal");
                break;
            }

            match self.queue.pull(&self.cancellation_token, self).await {
                Ok(true) => {},
                Ok(false) => break,
                Err(error) => {
                    error!(
                        worker_id = self.id,
                        stage = self.stage,
                        error = %error,
                        "queue pull failed"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(ERROR_BACKOFF) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        Ok(())
    }
}

#[async_trait]
impl MessageHandler for StageWorker {
    async fn handle(&self, payload: Bytes) -> Result<()> {
        self.stats.write().await.in_flight += 1;

        let result = self.handler.handle(payload).await;

        {
            let mut stats = self.stats.write().await;
            stats.in_flight -= 1;
            stats.messages_processed += 1;
            if result.is_err() {
                stats.messages_failed += 1;
            }
        }

        if let Err(ref error) = result {
            debug!(worker_id = self.id, stage = self.stage, error = %error, "message failed");
        }
        result
    }
}
