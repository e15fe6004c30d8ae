//! In-memory implementation of every repository trait.
//!
//! Backs unit tests, the test environment and single-node deployments that
//! can afford to lose state on restart. Semantics match the Postgres
//! backend: route conflicts, partition limits and ledger locking behave the
//! same.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use tokio::sync::{mpsc, Mutex, RwLock};

use super::{
    locks::KeyedLocks, DocumentRepository, DocumentWrite, ResourceRepository, StoreConfig,
    SubscriptionRepository, SubscriptionStream, STREAM_BUFFER,
};
use crate::{
    error::{CoreError, Result},
    ledger::{self, DeliverFn, LedgerEntry, LedgerKey, LedgerStore, TriggerOutcome},
    models::{
        Action, Document, DocumentId, PartitionId, Resource, ResourceId, Subscription,
        SubscriptionId,
    },
    resolver,
    time::Clock,
};

/// Subscriber counts of one resource; joins and leaves lock only this cell.
type PartitionCell = Arc<Mutex<BTreeMap<PartitionId, u32>>>;

#[derive(Debug, Default)]
struct ResourceState {
    resources: HashMap<ResourceId, Resource>,
    order: Vec<ResourceId>,
    routes: HashMap<String, ResourceId>,
    partitions: HashMap<ResourceId, PartitionCell>,
}

/// Repository backend holding all state in process memory.
#[derive(Debug)]
pub struct MemoryStore {
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    resources: RwLock<ResourceState>,
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    documents: RwLock<HashMap<DocumentId, Document>>,
    ledger: RwLock<HashMap<LedgerKey, LedgerEntry>>,
    ledger_locks: KeyedLocks<LedgerKey>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new(config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            resources: RwLock::new(ResourceState::default()),
            subscriptions: RwLock::new(HashMap::new()),
            documents: RwLock::new(HashMap::new()),
            ledger: RwLock::new(HashMap::new()),
            ledger_locks: KeyedLocks::new(),
        }
    }

    /// Number of ledger entries held.
    pub async fn ledger_len(&self) -> usize {
        self.ledger.read().await.len()
    }

    async fn partition_cell(&self, id: ResourceId) -> Result<PartitionCell> {
        self.resources
            .read()
            .await
            .partitions
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("resource {id}")))
    }

    async fn with_partitions(&self, mut resource: Resource) -> Result<Resource> {
        let cell = self.partition_cell(resource.id).await?;
        resource.partitions = cell.lock().await.clone();
        Ok(resource)
    }
}

#[async_trait::async_trait]
impl ResourceRepository for MemoryStore {
    async fn create(&self, resource: &Resource) -> Result<()> {
        let keys = resolver::route_keys(resource)?;
        let mut state = self.resources.write().await;

        if state.resources.contains_key(&resource.id) {
            return Err(CoreError::already_exists(format!("resource {}", resource.id)));
        }
        if let Some(key) = keys.iter().find(|key| state.routes.contains_key(*key)) {
            return Err(CoreError::already_exists(format!("route {key}")));
        }

        for key in keys {
            state.routes.insert(key, resource.id);
        }
        state.order.push(resource.id);
        state.partitions.insert(resource.id, PartitionCell::default());
        let mut stored = resource.clone();
        stored.partitions = BTreeMap::new();
        state.resources.insert(resource.id, stored);

        Ok(())
    }

    async fn find_by_id(&self, id: ResourceId) -> Result<Resource> {
        let resource = self
            .resources
            .read()
            .await
            .resources
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("resource {id}")))?;
        self.with_partitions(resource).await
    }

    async fn find_by_uri(&self, uri: &str) -> Result<Resource> {
        let resource = {
            let state = self.resources.read().await;
            let candidates = state.order.iter().filter_map(|id| state.resources.get(id));
            resolver::resolve(candidates, uri)
                .cloned()
                .ok_or_else(|| CoreError::not_found(format!("no resource matches {uri}")))?
        };
        self.with_partitions(resource).await
    }

    async fn partitions(&self, id: ResourceId) -> Result<Vec<PartitionId>> {
        let cell = self.partition_cell(id).await?;
        let partitions = cell.lock().await;
        Ok(partitions.keys().copied().collect())
    }

    async fn join_partition(&self, id: ResourceId) -> Result<PartitionId> {
        let cell = self.partition_cell(id).await?;
        let mut partitions = cell.lock().await;

        let open = partitions.iter_mut().find(|(_, count)| **count < self.config.partition_limit);
        let partition = match open {
            Some((partition, count)) => {
                *count += 1;
                *partition
            },
            None => {
                let partition = PartitionId::new();
                partitions.insert(partition, 1);
                partition
            },
        };

        tracing::debug!(resource_id = %id, partition = %partition, "joined partition");
        Ok(partition)
    }

    async fn leave_partition(&self, id: ResourceId, partition: PartitionId) -> Result<()> {
        let cell = self.partition_cell(id).await?;
        let mut partitions = cell.lock().await;

        match partitions.get_mut(&partition) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                partitions.remove(&partition);
            },
            None => {
                return Err(CoreError::not_found(format!("partition {partition} of resource {id}")));
            },
        }

        tracing::debug!(resource_id = %id, partition = %partition, "left partition");
        Ok(())
    }
}

#[async_trait::async_trait]
impl SubscriptionRepository for MemoryStore {
    async fn create(&self, subscription: &Subscription) -> Result<()> {
        let mut subscriptions = self.subscriptions.write().await;
        if subscriptions.contains_key(&subscription.id) {
            return Err(CoreError::already_exists(format!("subscription {}", subscription.id)));
        }
        subscriptions.insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: SubscriptionId) -> Result<Subscription> {
        self.subscriptions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("subscription {id}")))
    }

    async fn delete(&self, id: SubscriptionId) -> Result<Subscription> {
        let removed = self
            .subscriptions
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| CoreError::not_found(format!("subscription {id}")))?;
        self.ledger.write().await.retain(|key, _| key.subscription_id != id);
        Ok(removed)
    }

    async fn find_by_partition(
        &self,
        resource_id: ResourceId,
        partition: PartitionId,
    ) -> Result<SubscriptionStream> {
        let mut matching: Vec<Subscription> = self
            .subscriptions
            .read()
            .await
            .values()
            .filter(|s| s.resource_id == resource_id && s.partition == partition)
            .cloned()
            .collect();
        matching.sort_by_key(|s| (s.created_at, s.id));

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            for subscription in matching {
                if tx.send(Ok(subscription)).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn trigger<'a>(
        &'a self,
        action: Action,
        document: &'a Document,
        subscription: &'a Subscription,
        deliver: DeliverFn<'a>,
    ) -> Result<TriggerOutcome> {
        let key = LedgerKey::new(subscription.id, document.id.clone());
        let _guard = self.ledger_locks.lock(key).await;
        ledger::trigger(self, self.clock.as_ref(), action, document, subscription, deliver)
            .await
    }
}

#[async_trait::async_trait]
impl DocumentRepository for MemoryStore {
    async fn upsert(&self, document: Document) -> Result<DocumentWrite> {
        let mut documents = self.documents.write().await;
        let write = match documents.get(&document.id) {
            None => DocumentWrite::Created,
            Some(current) if document.revision > current.revision => {
                DocumentWrite::Advanced { previous: current.revision }
            },
            Some(current) if document.revision == current.revision => DocumentWrite::Unchanged,
            Some(current) => DocumentWrite::Stale { current: current.revision },
        };

        if matches!(write, DocumentWrite::Created | DocumentWrite::Advanced { .. }) {
            documents.insert(document.id.clone(), document);
        }
        Ok(write)
    }

    async fn find_by_id(&self, id: &DocumentId) -> Result<Document> {
        self.documents
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("document {id}")))
    }

    async fn delete(&self, id: &DocumentId) -> Result<Document> {
        self.documents
            .write()
            .await
            .remove(id)
            .ok_or_else(|| CoreError::not_found(format!("document {id}")))
    }
}

#[async_trait::async_trait]
impl LedgerStore for MemoryStore {
    async fn find_document(&self, id: &DocumentId) -> Result<Document> {
        DocumentRepository::find_by_id(self, id).await
    }

    async fn find_entry(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>> {
        Ok(self.ledger.read().await.get(key).cloned())
    }

    async fn upsert_entry(&self, entry: &LedgerEntry) -> Result<()> {
        self.ledger.write().await.insert(entry.key(), entry.clone());
        Ok(())
    }

    async fn remove_entry(&self, key: &LedgerKey) -> Result<()> {
        self.ledger.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{
        models::{ChangeDetection, ContentOptions, DeliveryPolicy, Endpoint},
        time::TestClock,
    };

    fn store(limit: u32) -> MemoryStore {
        MemoryStore::new(StoreConfig { partition_limit: limit }, Arc::new(TestClock::new()))
    }

    fn resource(path: &str) -> Resource {
        Resource {
            id: ResourceId::new(),
            addresses: vec!["https://api.example.com".to_string()],
            path: path.to_string(),
            change: ChangeDetection { field: "seq".to_string(), format: String::new() },
            partitions: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    fn document(revision: i64) -> Document {
        Document {
            id: DocumentId::from("https://api.example.com/users/1"),
            resource_id: ResourceId::new(),
            content: Default::default(),
            revision,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn route_conflicts_rejected() {
        let store = store(10);
        ResourceRepository::create(&store, &resource("/users/{id}")).await.unwrap();

        let err = ResourceRepository::create(&store, &resource("/users/{uid}")).await.unwrap_err();
        assert!(matches!(err, CoreError::AlreadyExists(_)));

        ResourceRepository::create(&store, &resource("/users/{id}/posts/{post}")).await.unwrap();
    }

    #[tokio::test]
    async fn find_by_uri_prefers_literal_segments() {
        let store = store(10);
        let wild = resource("/a/{x}/{y}");
        let literal = resource("/a/123/{y}");
        ResourceRepository::create(&store, &wild).await.unwrap();
        ResourceRepository::create(&store, &literal).await.unwrap();

        let found = store.find_by_uri("https://api.example.com/a/123/z").await.unwrap();
        assert_eq!(found.id, literal.id);

        let err = store.find_by_uri("https://api.example.com/b/1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn partitions_fill_then_split() {
        let store = store(2);
        let r = resource("/users/{id}");
        ResourceRepository::create(&store, &r).await.unwrap();

        let first = store.join_partition(r.id).await.unwrap();
        let second = store.join_partition(r.id).await.unwrap();
        let third = store.join_partition(r.id).await.unwrap();

        assert_eq!(first, second);
        assert_ne!(first, third);
        assert_eq!(store.partitions(r.id).await.unwrap().len(), 2);

        store.leave_partition(r.id, third).await.unwrap();
        assert_eq!(store.partitions(r.id).await.unwrap(), vec![first]);

        let err = store.leave_partition(r.id, third).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn concurrent_joins_respect_the_limit() {
        let store = Arc::new(store(3));
        let r = resource("/users/{id}");
        ResourceRepository::create(store.as_ref(), &r).await.unwrap();

        let id = r.id;
        let joins: Vec<_> = (0..20)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.join_partition(id).await })
            })
            .collect();
        for join in joins {
            join.await.unwrap().unwrap();
        }

        let counts = ResourceRepository::find_by_id(store.as_ref(), r.id).await.unwrap().partitions;
        assert_eq!(counts.len(), 7);
        assert_eq!(counts.values().sum::<u32>(), 20);
        assert!(counts.values().all(|count| *count <= 3));
    }

    #[tokio::test]
    async fn partition_changes_do_not_block_other_resources() {
        let store = store(10);
        let busy = resource("/users/{id}");
        let other = resource("/orders/{id}");
        ResourceRepository::create(&store, &busy).await.unwrap();
        ResourceRepository::create(&store, &other).await.unwrap();

        let cell = store.partition_cell(busy.id).await.unwrap();
        let _held = cell.lock().await;

        let joined = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            store.join_partition(other.id),
        )
        .await;
        assert!(joined.is_ok_and(|partition| partition.is_ok()));
        let found = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            store.find_by_uri("https://api.example.com/orders/1"),
        )
        .await;
        assert!(found.is_ok_and(|resource| resource.is_ok()));
    }

    #[tokio::test]
    async fn freed_slots_are_reused() {
        let store = store(2);
        let r = resource("/users/{id}");
        ResourceRepository::create(&store, &r).await.unwrap();

        let first = store.join_partition(r.id).await.unwrap();
        store.join_partition(r.id).await.unwrap();
        store.leave_partition(r.id, first).await.unwrap();

        assert_eq!(store.join_partition(r.id).await.unwrap(), first);
    }

    #[tokio::test]
    async fn document_upsert_only_moves_forward() {
        let store = store(10);

        assert_eq!(store.upsert(document(2)).await.unwrap(), DocumentWrite::Created);
        assert_eq!(store.upsert(document(2)).await.unwrap(), DocumentWrite::Unchanged);
        assert_eq!(store.upsert(document(1)).await.unwrap(), DocumentWrite::Stale { current: 2 });
        assert_eq!(
            store.upsert(document(5)).await.unwrap(),
            DocumentWrite::Advanced { previous: 2 }
        );

        let id = DocumentId::from("https://api.example.com/users/1");
        assert_eq!(DocumentRepository::find_by_id(&store, &id).await.unwrap().revision, 5);
        DocumentRepository::delete(&store, &id).await.unwrap();
        assert!(DocumentRepository::find_by_id(&store, &id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn partition_stream_yields_only_members() {
        let store = store(10);
        let resource_id = ResourceId::new();
        let partition = PartitionId::new();

        for target in [partition, partition, PartitionId::new()] {
            let subscription = Subscription {
                id: SubscriptionId::new(),
                resource_id,
                partition: target,
                endpoint: Endpoint::new("https://cb.io/hook"),
                delivery: DeliveryPolicy::default(),
                content: ContentOptions::default(),
                data: Default::default(),
                created_at: Utc::now(),
            };
            SubscriptionRepository::create(&store, &subscription).await.unwrap();
        }

        let mut stream = store.find_by_partition(resource_id, partition).await.unwrap();
        let mut count = 0;
        while let Some(item) = stream.recv().await {
            assert_eq!(item.unwrap().partition, partition);
            count += 1;
        }
        assert_eq!(count, 2);
    }
}
