//! Integration tests for ledger locking through the repository seam.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use futures::FutureExt;
use herald_core::{
    error::BoxError,
    models::{ChangeDetection, ContentOptions, DeliveryPolicy, Endpoint},
    storage::{StoreConfig, Storage},
    Action, DeliverFn, Document, DocumentId, PartitionId, Resource, ResourceId, SkipReason,
    Subscription, SubscriptionId, TestClock, TriggerOutcome,
};

fn fixtures() -> (Storage, Subscription, Document) {
    let storage = Storage::memory(StoreConfig::default(), Arc::new(TestClock::new()));
    let resource = Resource {
        id: ResourceId::new(),
        addresses: vec!["https://api.example.com".to_string()],
        path: "/users/{id}".to_string(),
        change: ChangeDetection { field: "seq".to_string(), format: String::new() },
        partitions: BTreeMap::new(),
        created_at: Utc::now(),
    };
    let subscription = Subscription {
        id: SubscriptionId::new(),
        resource_id: resource.id,
        partition: PartitionId::new(),
        endpoint: Endpoint::new("https://cb.io/{id}"),
        delivery: DeliveryPolicy::default(),
        content: ContentOptions::default(),
        data: Default::default(),
        created_at: Utc::now(),
    };
    let document = Document {
        id: DocumentId::from("https://api.example.com/users/1"),
        resource_id: resource.id,
        content: Default::default(),
        revision: 1,
        updated_at: Utc::now(),
    };
    (storage, subscription, document)
}

fn counting<'a>(calls: &Arc<AtomicUsize>) -> DeliverFn<'a> {
    let calls = calls.clone();
    Box::new(move |_, _| {
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok::<(), BoxError>(())
        }
        .boxed()
    })
}

/// Concurrent replays of the same change produce exactly one callback.
#[tokio::test]
async fn concurrent_replays_deliver_once() {
    let (storage, subscription, document) = fixtures();
    storage.documents.upsert(document.clone()).await.unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let attempts = (0..8).map(|_| {
        let storage = storage.clone();
        let subscription = subscription.clone();
        let document = document.clone();
        let calls = calls.clone();
        tokio::spawn(async move {
            let deliver = counting(&calls);
            storage.subscriptions.trigger(Action::Create, &document, &subscription, deliver).await
        })
    });

    let outcomes: Vec<_> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let delivered = outcomes
        .iter()
        .filter(|o| matches!(o, TriggerOutcome::Delivered { action: Action::Create, .. }))
        .count();
    assert_eq!(delivered, 1);
}

/// Deleting a subscription forgets its ledger entries.
#[tokio::test]
async fn subscription_delete_clears_ledger() {
    let (storage, subscription, document) = fixtures();
    storage.documents.upsert(document.clone()).await.unwrap();
    storage.subscriptions.create(&subscription).await.unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    storage
        .subscriptions
        .trigger(Action::Create, &document, &subscription, counting(&calls))
        .await
        .unwrap();
    storage.subscriptions.delete(subscription.id).await.unwrap();

    let outcome = storage
        .subscriptions
        .trigger(Action::Delete, &document, &subscription, counting(&calls))
        .await
        .unwrap();

    assert_eq!(outcome, TriggerOutcome::Skipped(SkipReason::NoEntry));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
