//! Delivery ledger: per-subscriber memory of the last delivered revision.
//!
//! The queues underneath the pipeline deliver at least once and in no
//! particular order. The ledger turns that into idempotent callbacks: a
//! (subscription, document) pair is only notified when the authoritative
//! document revision is strictly newer than the last one delivered.
//!
//! ```text
//!               no entry                       entry
//!   delete  ->  skip                           deliver delete, remove entry
//!   create  ->  deliver create, insert entry   deliver update if newer
//!   update  ->  deliver create, insert entry   deliver update if newer
//! ```
//!
//! Failed deliveries against an existing entry are counted. While the
//! subscription's backoff window is open the call fails with `RetryNotDue`;
//! once the attempt budget or the change TTL is spent the revision is given
//! up and the entry moves on so newer revisions still flow.
//!
//! Callers must serialize [`trigger`] per key; the repositories do this with
//! keyed locks.

use std::fmt;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::{
    error::{BoxError, CoreError, Result},
    models::{Action, Document, DocumentId, Subscription, SubscriptionId},
    retry::RetryPolicy,
    time::Clock,
};

/// Deliver function handed to the ledger.
///
/// Receives the resolved action and the document to send. Any error counts
/// as a failed delivery.
pub type DeliverFn<'a> = Box<
    dyn FnOnce(Action, Document) -> BoxFuture<'a, std::result::Result<(), BoxError>> + Send + 'a,
>;

/// Ledger key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerKey {
    /// Subscription side.
    pub subscription_id: SubscriptionId,
    /// Document side.
    pub document_id: DocumentId,
}

impl LedgerKey {
    /// Creates a key.
    pub fn new(subscription_id: SubscriptionId, document_id: DocumentId) -> Self {
        Self { subscription_id, document_id }
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subscription_id, self.document_id)
    }
}

/// Ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Subscription side of the key.
    pub subscription_id: SubscriptionId,
    /// Document side of the key.
    pub document_id: DocumentId,
    /// Last revision delivered (or given up on).
    pub last_revision: i64,
    /// Earliest time the next attempt may run after a failure.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Consecutive failed attempts.
    pub retry_count: u32,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Creates a clean entry after a successful delivery.
    pub fn new(key: LedgerKey, last_revision: i64, at: DateTime<Utc>) -> Self {
        Self {
            subscription_id: key.subscription_id,
            document_id: key.document_id,
            last_revision,
            next_retry_at: None,
            retry_count: 0,
            updated_at: at,
        }
    }

    /// Returns the key of this entry.
    pub fn key(&self) -> LedgerKey {
        LedgerKey::new(self.subscription_id, self.document_id.clone())
    }

    fn ensure_due(&self, now: DateTime<Utc>) -> Result<()> {
        match self.next_retry_at {
            Some(until) if until > now => Err(CoreError::RetryNotDue { until }),
            _ => Ok(()),
        }
    }

    fn advance(&mut self, revision: i64, at: DateTime<Utc>) {
        self.last_revision = revision;
        self.next_retry_at = None;
        self.retry_count = 0;
        self.updated_at = at;
    }
}

/// Persistence seam for ledger rows.
///
/// Implementations that lock the pair read the document under the same lock,
/// so a trigger never needs a second connection.
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    /// Loads the current stored document.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the document is gone.
    async fn find_document(&self, id: &DocumentId) -> Result<Document>;

    /// Loads the entry for a key.
    async fn find_entry(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>>;

    /// Inserts or replaces an entry.
    async fn upsert_entry(&self, entry: &LedgerEntry) -> Result<()>;

    /// Removes an entry; missing entries are not an error.
    async fn remove_entry(&self, key: &LedgerKey) -> Result<()>;
}

/// Why a trigger ended without a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Delete for a pair that was never notified.
    NoEntry,
    /// Authoritative revision is not newer than the last delivered one.
    NotNewer {
        /// Revision in the ledger
        last: i64,
        /// Revision of the current document
        current: i64,
    },
    /// Change is older than the subscription TTL.
    Expired,
    /// Attempt budget spent; the revision was given up.
    RetriesExhausted {
        /// Failed attempts recorded
        attempts: u32,
    },
    /// Document vanished before an update could be sent.
    DocumentGone,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoEntry => write!(f, "no prior delivery"),
            Self::NotNewer { last, current } => {
                write!(f, "revision {current} is not newer than {last}")
            },
            Self::Expired => write!(f, "change outlived its ttl"),
            Self::RetriesExhausted { attempts } => {
                write!(f, "gave up after {attempts} failed attempts")
            },
            Self::DocumentGone => write!(f, "document no longer exists"),
        }
    }
}

/// Result of a ledger decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Callback ran and succeeded.
    Delivered {
        /// Action actually sent
        action: Action,
        /// Revision recorded
        revision: i64,
    },
    /// No callback was made.
    Skipped(SkipReason),
}

/// Applies the dedupe rules for one (subscription, document) pair.
///
/// # Errors
///
/// Returns `Callback` when delivery failed and should be redelivered,
/// `RetryNotDue` while a backoff window is open, or storage errors.
pub async fn trigger<'a>(
    ledger: &dyn LedgerStore,
    clock: &dyn Clock,
    action: Action,
    document: &Document,
    subscription: &Subscription,
    deliver: DeliverFn<'a>,
) -> Result<TriggerOutcome> {
    let key = LedgerKey::new(subscription.id, document.id.clone());
    let policy = &subscription.delivery.retry;
    let now = clock.now();

    match (ledger.find_entry(&key).await?, action) {
        (None, Action::Delete) => Ok(TriggerOutcome::Skipped(SkipReason::NoEntry)),
        (None, _) => {
            if is_expired(policy, document.updated_at, now) {
                return Ok(TriggerOutcome::Skipped(SkipReason::Expired));
            }
            deliver(Action::Create, document.clone()).await.map_err(CoreError::Callback)?;
            ledger.upsert_entry(&LedgerEntry::new(key, document.revision, clock.now())).await?;
            Ok(TriggerOutcome::Delivered { action: Action::Create, revision: document.revision })
        },
        (Some(entry), Action::Delete) => {
            entry.ensure_due(now)?;
            let mut gone = document.clone();
            gone.revision = gone.revision.max(entry.last_revision);
            let revision = gone.revision;
            match deliver(Action::Delete, gone).await {
                Ok(()) => {
                    ledger.remove_entry(&key).await?;
                    Ok(TriggerOutcome::Delivered { action: Action::Delete, revision })
                },
                Err(error) => record_failure(ledger, policy, entry, None, clock, error).await,
            }
        },
        (Some(mut entry), _) => {
            let current = match ledger.find_document(&document.id).await {
                Ok(current) => current,
                Err(e) if e.is_not_found() => {
                    return Ok(TriggerOutcome::Skipped(SkipReason::DocumentGone));
                },
                Err(e) => return Err(e),
            };

            if current.revision <= entry.last_revision {
                return Ok(TriggerOutcome::Skipped(SkipReason::NotNewer {
                    last: entry.last_revision,
                    current: current.revision,
                }));
            }

            entry.ensure_due(now)?;

            let revision = current.revision;
            if is_expired(policy, current.updated_at, now) {
                entry.advance(revision, now);
                ledger.upsert_entry(&entry).await?;
                return Ok(TriggerOutcome::Skipped(SkipReason::Expired));
            }

            match deliver(Action::Update, current).await {
                Ok(()) => {
                    entry.advance(revision, clock.now());
                    ledger.upsert_entry(&entry).await?;
                    Ok(TriggerOutcome::Delivered { action: Action::Update, revision })
                },
                Err(error) => {
                    record_failure(ledger, policy, entry, Some(revision), clock, error).await
                },
            }
        },
    }
}

fn is_expired(policy: &RetryPolicy, changed_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    let Some(ttl) = policy.ttl() else {
        return false;
    };
    match chrono::Duration::from_std(ttl) {
        Ok(ttl) => now - changed_at > ttl,
        Err(_) => false,
    }
}

async fn record_failure(
    ledger: &dyn LedgerStore,
    policy: &RetryPolicy,
    mut entry: LedgerEntry,
    failed_revision: Option<i64>,
    clock: &dyn Clock,
    error: BoxError,
) -> Result<TriggerOutcome> {
    let now = clock.now();
    entry.retry_count = entry.retry_count.saturating_add(1);
    entry.updated_at = now;

    if policy.is_exhausted(entry.retry_count) {
        let attempts = entry.retry_count;
        tracing::warn!(
            subscription_id = %entry.subscription_id,
            document_id = %entry.document_id,
            attempts,
            error = %error,
            "giving up on change after repeated delivery failures"
        );
        match failed_revision {
            Some(revision) => {
                entry.advance(revision, now);
                ledger.upsert_entry(&entry).await?;
            },
            None => ledger.remove_entry(&entry.key()).await?,
        }
        return Ok(TriggerOutcome::Skipped(SkipReason::RetriesExhausted { attempts }));
    }

    let delay = chrono::Duration::from_std(policy.delay_for(entry.retry_count))
        .unwrap_or_else(|_| chrono::Duration::hours(1));
    entry.next_retry_at = Some(now + delay);
    ledger.upsert_entry(&entry).await?;

    Err(CoreError::Callback(error))
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use chrono::TimeZone;
    use futures::FutureExt;
    use serde_json::json;

    use super::*;
    use crate::{
        models::{
            ChangeDetection, ContentOptions, DeliveryPolicy, Endpoint, PartitionId, Resource,
            ResourceId,
        },
        storage::{memory::MemoryStore, DocumentRepository, StoreConfig},
        time::TestClock,
    };

    struct Harness {
        store: MemoryStore,
        clock: TestClock,
        subscription: Subscription,
        resource_id: ResourceId,
    }

    impl Harness {
        fn new() -> Self {
            let clock = TestClock::at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
            let store = MemoryStore::new(StoreConfig::default(), Arc::new(clock.clone()));
            let resource = Resource {
                id: ResourceId::new(),
                addresses: vec!["https://api.example.com".to_string()],
                path: "/users/{id}".to_string(),
                change: ChangeDetection { field: "seq".to_string(), format: String::new() },
                partitions: Default::default(),
                created_at: clock.now(),
            };
            let subscription = Subscription {
                id: SubscriptionId::new(),
                resource_id: resource.id,
                partition: PartitionId::new(),
                endpoint: Endpoint::new("https://cb.io/{id}"),
                delivery: DeliveryPolicy {
                    retry: RetryPolicy { max_attempts: 3, ..Default::default() },
                    ..Default::default()
                },
                content: ContentOptions::default(),
                data: Default::default(),
                created_at: clock.now(),
            };
            Self { store, clock, subscription, resource_id: resource.id }
        }

        async fn put(&self, revision: i64) -> Document {
            let document = Document {
                id: DocumentId::from("https://api.example.com/users/1"),
                resource_id: self.resource_id,
                content: json!({"seq": revision}).as_object().cloned().unwrap(),
                revision,
                updated_at: self.clock.now(),
            };
            self.store.upsert(document.clone()).await.unwrap();
            document
        }

        async fn run(
            &self,
            action: Action,
            document: &Document,
            calls: &Arc<AtomicUsize>,
            fail: bool,
        ) -> Result<TriggerOutcome> {
            let calls = calls.clone();
            let deliver: DeliverFn<'_> = Box::new(move |_, _| {
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let result: std::result::Result<(), BoxError> =
                        if fail { Err("endpoint down".into()) } else { Ok(()) };
                    result
                }
                .boxed()
            });
            trigger(&self.store, &self.clock, action, document, &self.subscription, deliver).await
        }
    }

    #[tokio::test]
    async fn delete_without_entry_never_calls_back() {
        let h = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let doc = Document::tombstone(DocumentId::from("/users/9"), h.resource_id, 0, h.clock.now());

        let outcome = h.run(Action::Delete, &doc, &calls, false).await.unwrap();

        assert_eq!(outcome, TriggerOutcome::Skipped(SkipReason::NoEntry));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn first_update_is_delivered_as_create() {
        let h = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let doc = h.put(1).await;

        let outcome = h.run(Action::Update, &doc, &calls, false).await.unwrap();

        assert_eq!(outcome, TriggerOutcome::Delivered { action: Action::Create, revision: 1 });
        let entry = h.store.find_entry(&LedgerKey::new(h.subscription.id, doc.id.clone())).await.unwrap();
        assert_eq!(entry.map(|e| e.last_revision), Some(1));
    }

    #[tokio::test]
    async fn replayed_revision_is_not_redelivered() {
        let h = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let doc = h.put(1).await;

        h.run(Action::Create, &doc, &calls, false).await.unwrap();
        let replay = h.run(Action::Update, &doc, &calls, false).await.unwrap();

        assert_eq!(replay, TriggerOutcome::Skipped(SkipReason::NotNewer { last: 1, current: 1 }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let newer = h.put(2).await;
        let outcome = h.run(Action::Update, &newer, &calls, false).await.unwrap();
        assert_eq!(outcome, TriggerOutcome::Delivered { action: Action::Update, revision: 2 });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn delete_after_create_removes_entry() {
        let h = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let doc = h.put(1).await;
        h.run(Action::Create, &doc, &calls, false).await.unwrap();

        let outcome = h.run(Action::Delete, &doc, &calls, false).await.unwrap();

        assert_eq!(outcome, TriggerOutcome::Delivered { action: Action::Delete, revision: 1 });
        let key = LedgerKey::new(h.subscription.id, doc.id.clone());
        assert!(h.store.find_entry(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_update_opens_backoff_window() {
        let h = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let doc = h.put(1).await;
        h.run(Action::Create, &doc, &calls, false).await.unwrap();
        let newer = h.put(2).await;

        let err = h.run(Action::Update, &newer, &calls, true).await.unwrap_err();
        assert!(matches!(err, CoreError::Callback(_)));

        let err = h.run(Action::Update, &newer, &calls, false).await.unwrap_err();
        assert!(matches!(err, CoreError::RetryNotDue { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        h.clock.advance(Duration::from_secs(2));
        let outcome = h.run(Action::Update, &newer, &calls, false).await.unwrap();
        assert_eq!(outcome, TriggerOutcome::Delivered { action: Action::Update, revision: 2 });
    }

    #[tokio::test]
    async fn exhausted_retries_advance_the_ledger() {
        let h = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let doc = h.put(1).await;
        h.run(Action::Create, &doc, &calls, false).await.unwrap();
        let newer = h.put(2).await;

        for _ in 0..2 {
            assert!(h.run(Action::Update, &newer, &calls, true).await.is_err());
            h.clock.advance(Duration::from_secs(60));
        }
        let outcome = h.run(Action::Update, &newer, &calls, true).await.unwrap();

        assert_eq!(outcome, TriggerOutcome::Skipped(SkipReason::RetriesExhausted { attempts: 3 }));
        let key = LedgerKey::new(h.subscription.id, doc.id.clone());
        let entry = h.store.find_entry(&key).await.unwrap().unwrap();
        assert_eq!(entry.last_revision, 2);
        assert_eq!(entry.retry_count, 0);
    }

    /// Ledger whose document view differs from the shared document map.
    struct Pinned<'a> {
        inner: &'a MemoryStore,
        document: Document,
    }

    #[async_trait::async_trait]
    impl LedgerStore for Pinned<'_> {
        async fn find_document(&self, _id: &DocumentId) -> Result<Document> {
            Ok(self.document.clone())
        }

        async fn find_entry(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>> {
            self.inner.find_entry(key).await
        }

        async fn upsert_entry(&self, entry: &LedgerEntry) -> Result<()> {
            self.inner.upsert_entry(entry).await
        }

        async fn remove_entry(&self, key: &LedgerKey) -> Result<()> {
            self.inner.remove_entry(key).await
        }
    }

    #[tokio::test]
    async fn update_reads_the_document_through_the_ledger_store() {
        let h = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let doc = h.put(1).await;
        h.run(Action::Create, &doc, &calls, false).await.unwrap();

        let mut locked = doc.clone();
        locked.revision = 7;
        let ledger = Pinned { inner: &h.store, document: locked };
        let sent = Arc::new(std::sync::Mutex::new(None));
        let seen = sent.clone();
        let deliver: DeliverFn<'_> = Box::new(move |_, document| {
            *seen.lock().unwrap() = Some(document.revision);
            async { Ok::<(), BoxError>(()) }.boxed()
        });

        let outcome = trigger(&ledger, &h.clock, Action::Update, &doc, &h.subscription, deliver)
            .await
            .unwrap();

        assert_eq!(outcome, TriggerOutcome::Delivered { action: Action::Update, revision: 7 });
        assert_eq!(*sent.lock().unwrap(), Some(7));
        assert_eq!(DocumentRepository::find_by_id(&h.store, &doc.id).await.unwrap().revision, 1);
    }

    #[tokio::test]
    async fn stale_changes_expire() {
        let h = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let doc = h.put(1).await;

        h.clock.advance(Duration::from_secs(86_400 + 1));
        let outcome = h.run(Action::Create, &doc, &calls, false).await.unwrap();

        assert_eq!(outcome, TriggerOutcome::Skipped(SkipReason::Expired));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
