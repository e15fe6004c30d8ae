//! Entry point for document changes.
//!
//! Resolves the owning resource, derives the revision, stores the snapshot
//! and enqueues a change for the partition stage when the stored revision
//! actually moved.

use std::sync::Arc;

use herald_core::{
    revision,
    storage::{DocumentWrite, Storage},
    Action, Clock, Document, DocumentId, ResourceId,
};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument};

use super::{messages::PartitionMessage, partition::PartitionStage};
use crate::{error::Result, queue::Queue};

/// Result of ingesting one document snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Document id as stored.
    pub document_id: DocumentId,
    /// Resource the id resolved to.
    pub resource_id: ResourceId,
    /// Derived revision.
    pub revision: i64,
    /// What the store did with the snapshot.
    pub write: DocumentWrite,
    /// Change enqueued for the pipeline, if any.
    pub enqueued: Option<Action>,
}

/// Accepts document snapshots and deletions.
#[derive(Debug, Clone)]
pub struct Ingestor {
    storage: Storage,
    partition_queue: Arc<dyn Queue>,
    clock: Arc<dyn Clock>,
}

impl Ingestor {
    /// Creates an ingestor feeding `partition_queue`.
    pub fn new(storage: Storage, partition_queue: Arc<dyn Queue>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, partition_queue, clock }
    }

    /// Stores a snapshot and enqueues `create` or `update` unless the
    /// snapshot is older than the stored one.
    ///
    /// A snapshot equal to the stored revision is enqueued as `update` again,
    /// so retrying an ingest whose enqueue was interrupted still reaches the
    /// pipeline.
    ///
    /// # Errors
    ///
    /// - `Storage(NotFound)` when no resource matches the URI
    /// - `Storage(FormatNotSupported)` when the revision cannot be derived
    /// - queue failures
    #[instrument(skip(self, content), fields(document_id = %uri))]
    pub async fn ingest(&self, uri: &str, content: Map<String, Value>) -> Result<IngestOutcome> {
        let resource = self.storage.resources.find_by_uri(uri).await?;
        let revision = revision::derive(&content, &resource.change)?;

        let document = Document {
            id: DocumentId::from(uri),
            resource_id: resource.id,
            content,
            revision,
            updated_at: self.clock.now(),
        };
        let document_id = document.id.clone();
        let write = self.storage.documents.upsert(document).await?;

        let enqueued = write.action();
        match enqueued {
            Some(action) => {
                self.enqueue(action, &document_id, resource.id).await?;
                info!(resource_id = %resource.id, %action, revision, "document change accepted");
            },
            None => debug!(?write, revision, "document older than stored, nothing to notify"),
        }

        Ok(IngestOutcome { document_id, resource_id: resource.id, revision, write, enqueued })
    }

    /// Removes a document and enqueues `delete`.
    ///
    /// Removing a document that is already gone still enqueues `delete` as
    /// long as a resource matches the URI, and returns a tombstone.
    ///
    /// # Errors
    ///
    /// Returns `Storage(NotFound)` when no resource matches the URI and queue
    /// failures.
    #[instrument(skip(self), fields(document_id = %uri))]
    pub async fn remove(&self, uri: &str) -> Result<Document> {
        let id = DocumentId::from(uri);
        let document = match self.storage.documents.delete(&id).await {
            Ok(document) => document,
            Err(e) if e.is_not_found() => {
                let resource = self.storage.resources.find_by_uri(uri).await?;
                debug!(resource_id = %resource.id, "document already removed, enqueueing delete");
                Document::tombstone(id, resource.id, 0, self.clock.now())
            },
            Err(e) => return Err(e.into()),
        };
        self.enqueue(Action::Delete, &document.id, document.resource_id).await?;
        info!(resource_id = %document.resource_id, "document deletion accepted");
        Ok(document)
    }

    /// Pushes a change straight onto the partition queue.
    ///
    /// # Errors
    ///
    /// Returns queue or serialization failures.
    pub async fn enqueue(
        &self,
        action: Action,
        document_id: &DocumentId,
        resource_id: ResourceId,
    ) -> Result<()> {
        let message = PartitionMessage { action, document_id: document_id.clone(), resource_id };
        PartitionStage::push(self.partition_queue.as_ref(), &message).await
    }
}
