//! Repository seams for resources, subscriptions, documents and the
//! delivery ledger.
//!
//! Two backends implement every trait: [`memory::MemoryStore`] for tests and
//! single-node runs, and [`postgres::PgStore`] for durable deployments.
//! Everything above this module talks to the traits only, through the
//! [`Storage`] bundle.

use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::mpsc;

pub mod locks;
pub mod memory;
pub mod postgres;

use crate::{
    error::Result,
    ledger::{DeliverFn, TriggerOutcome},
    models::{
        Action, Document, DocumentId, PartitionId, Resource, ResourceId, Subscription,
        SubscriptionId,
    },
    time::Clock,
};

/// Buffer size of subscription streams.
pub const STREAM_BUFFER: usize = 64;

/// Bounded stream of subscriptions; an `Err` item aborts the stream.
pub type SubscriptionStream = mpsc::Receiver<Result<Subscription>>;

/// Settings shared by both backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// Maximum subscriptions per partition.
    pub partition_limit: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { partition_limit: 100 }
    }
}

/// Outcome of a document upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentWrite {
    /// First revision stored for this id.
    Created,
    /// Revision moved forward.
    Advanced {
        /// Revision that was replaced
        previous: i64,
    },
    /// Same revision already stored; nothing written. Still re-enqueued as
    /// an update in case the earlier enqueue never happened; the ledger
    /// drops it if it was already delivered.
    Unchanged,
    /// Incoming revision is older than the stored one; nothing written.
    Stale {
        /// Revision currently stored
        current: i64,
    },
}

impl DocumentWrite {
    /// Action to enqueue for this write, if any.
    pub fn action(self) -> Option<Action> {
        match self {
            Self::Created => Some(Action::Create),
            Self::Advanced { .. } | Self::Unchanged => Some(Action::Update),
            Self::Stale { .. } => None,
        }
    }
}

/// Resource registry, resolver and partition manager.
#[async_trait::async_trait]
pub trait ResourceRepository: Send + Sync {
    /// Registers a resource.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` on id collision or when another resource
    /// routes the same address and canonical path.
    async fn create(&self, resource: &Resource) -> Result<()>;

    /// Loads a resource with its current partition counts.
    async fn find_by_id(&self, id: ResourceId) -> Result<Resource>;

    /// Resolves the most specific resource for a concrete URI.
    async fn find_by_uri(&self, uri: &str) -> Result<Resource>;

    /// Non-empty partitions of a resource in deterministic order.
    async fn partitions(&self, id: ResourceId) -> Result<Vec<PartitionId>>;

    /// Assigns a slot in the first partition below the limit, minting a new
    /// partition when all are full.
    async fn join_partition(&self, id: ResourceId) -> Result<PartitionId>;

    /// Releases a slot; the partition disappears when it empties.
    async fn leave_partition(&self, id: ResourceId, partition: PartitionId) -> Result<()>;
}

/// Subscription registry and ledger entry point.
#[async_trait::async_trait]
pub trait SubscriptionRepository: Send + Sync {
    /// Stores a subscription whose partition has already been joined.
    async fn create(&self, subscription: &Subscription) -> Result<()>;

    /// Loads a subscription.
    async fn find_by_id(&self, id: SubscriptionId) -> Result<Subscription>;

    /// Removes a subscription and its ledger entries, returning it.
    async fn delete(&self, id: SubscriptionId) -> Result<Subscription>;

    /// Streams the subscriptions of one partition.
    async fn find_by_partition(
        &self,
        resource_id: ResourceId,
        partition: PartitionId,
    ) -> Result<SubscriptionStream>;

    /// Runs the ledger decision for one pair under its per-key lock.
    async fn trigger<'a>(
        &'a self,
        action: Action,
        document: &'a Document,
        subscription: &'a Subscription,
        deliver: DeliverFn<'a>,
    ) -> Result<TriggerOutcome>;
}

/// Latest known snapshot of every document.
#[async_trait::async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Stores a document if its revision is newer than the stored one.
    async fn upsert(&self, document: Document) -> Result<DocumentWrite>;

    /// Loads the current snapshot.
    async fn find_by_id(&self, id: &DocumentId) -> Result<Document>;

    /// Removes a document, returning the last snapshot.
    async fn delete(&self, id: &DocumentId) -> Result<Document>;
}

/// Bundle of repository handles handed to the pipeline and the API.
#[derive(Clone)]
pub struct Storage {
    /// Resource registry and partition manager.
    pub resources: Arc<dyn ResourceRepository>,

    /// Subscription registry and ledger.
    pub subscriptions: Arc<dyn SubscriptionRepository>,

    /// Document snapshots.
    pub documents: Arc<dyn DocumentRepository>,

    backend: &'static str,
    pool: Option<PgPool>,
}

impl Storage {
    /// In-memory storage.
    pub fn memory(config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        let store = Arc::new(memory::MemoryStore::new(config, clock));
        Self {
            resources: store.clone(),
            subscriptions: store.clone(),
            documents: store,
            backend: "memory",
            pool: None,
        }
    }

    /// Postgres storage over an existing pool.
    pub fn postgres(pool: PgPool, config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        let store = Arc::new(postgres::PgStore::new(pool.clone(), config, clock));
        Self {
            resources: store.clone(),
            subscriptions: store.clone(),
            documents: store,
            backend: "postgres",
            pool: Some(pool),
        }
    }

    /// Backend name for logs and health output.
    pub fn backend(&self) -> &'static str {
        self.backend
    }

    /// Verifies the backend is reachable.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        if let Some(pool) = &self.pool {
            let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(pool).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("backend", &self.backend).finish_non_exhaustive()
    }
}
