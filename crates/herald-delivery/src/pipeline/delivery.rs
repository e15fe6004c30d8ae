//! Delivery stage: ledger decision plus webhook for one subscription.
//!
//! Loads the subscription, resource and document named by the message and
//! hands them to the subscription repository's `trigger`, with the HTTP
//! notification as the deliver function. Every outcome is published to the
//! configured [`EventHandler`].

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use herald_core::{
    error::BoxError, storage::Storage, Action, Clock, CoreError, DeliverFn, Document,
    EventHandler, NotificationEvent, NotificationRecord, Resource, Subscription, TriggerOutcome,
};
use tracing::{debug, instrument};

use super::{
    messages::{self, DeliveryMessage},
    within_deadline,
};
use crate::{
    client::DeliveryClient,
    error::{DeliveryError, Result},
    notification::{self, NotificationOutcome},
    queue::{MessageHandler, Queue},
};

/// Notifies one subscription about one change, at most once per revision.
#[derive(Debug, Clone)]
pub struct DeliveryStage {
    storage: Storage,
    client: Arc<DeliveryClient>,
    events: Arc<dyn EventHandler>,
    clock: Arc<dyn Clock>,
    deadline: Duration,
}

impl DeliveryStage {
    /// Creates the stage.
    pub fn new(
        storage: Storage,
        client: Arc<DeliveryClient>,
        events: Arc<dyn EventHandler>,
        clock: Arc<dyn Clock>,
        deadline: Duration,
    ) -> Self {
        Self { storage, client, events, clock, deadline }
    }

    /// Enqueues a change for one subscription.
    ///
    /// # Errors
    ///
    /// Returns queue or serialization failures.
    pub async fn push(queue: &dyn Queue, message: &DeliveryMessage) -> Result<()> {
        queue.push(messages::encode(message)?).await
    }

    /// Runs the ledger decision for the message's pair.
    ///
    /// Returns `None` when the subscription, the resource or (for creates
    /// and updates) the document no longer exists. Deletes of a document
    /// that is already gone use a tombstone.
    ///
    /// # Errors
    ///
    /// Returns storage failures and failed notifications; the ledger has
    /// already recorded the failure when this happens.
    #[instrument(
        skip(self, message),
        fields(
            subscription_id = %message.subscription_id,
            document_id = %message.document_id,
            action = %message.action,
        )
    )]
    pub async fn process(&self, message: DeliveryMessage) -> Result<Option<TriggerOutcome>> {
        let Some(subscription) =
            skip_missing(self.storage.subscriptions.find_by_id(message.subscription_id).await)?
        else {
            debug!("subscription vanished, skipping");
            return Ok(None);
        };
        let Some(resource) =
            skip_missing(self.storage.resources.find_by_id(message.resource_id).await)?
        else {
            debug!("resource vanished, skipping");
            return Ok(None);
        };

        let document = match skip_missing(
            self.storage.documents.find_by_id(&message.document_id).await,
        )? {
            Some(document) => document,
            None if message.action == Action::Delete => Document::tombstone(
                message.document_id.clone(),
                message.resource_id,
                0,
                self.clock.now(),
            ),
            None => {
                debug!("document vanished before delivery, skipping");
                self.events
                    .handle_event(NotificationEvent::Skipped {
                        subscription_id: subscription.id,
                        document_id: message.document_id.clone(),
                        reason: "document no longer exists".to_string(),
                    })
                    .await;
                return Ok(None);
            },
        };

        let (subscription_ref, resource_ref) = (&subscription, &resource);
        let deliver: DeliverFn<'_> = Box::new(move |action, document: Document| {
            async move {
                self.notify(subscription_ref, resource_ref, action, &document)
                    .await
                    .map_err(|e| Box::new(e) as BoxError)
            }
            .boxed()
        });

        let outcome = self
            .storage
            .subscriptions
            .trigger(message.action, &document, &subscription, deliver)
            .await
            .map_err(DeliveryError::from)?;

        match &outcome {
            TriggerOutcome::Delivered { action, revision } => {
                debug!(delivered = %action, revision, "notification delivered");
            },
            TriggerOutcome::Skipped(reason) => {
                debug!(%reason, "ledger skipped notification");
                self.events
                    .handle_event(NotificationEvent::Skipped {
                        subscription_id: subscription.id,
                        document_id: document.id.clone(),
                        reason: reason.to_string(),
                    })
                    .await;
            },
        }

        Ok(Some(outcome))
    }

    async fn notify(
        &self,
        subscription: &Subscription,
        resource: &Resource,
        action: Action,
        document: &Document,
    ) -> Result<()> {
        let mut record = NotificationRecord {
            subscription_id: subscription.id,
            document_id: document.id.clone(),
            action,
            revision: document.revision,
            url: subscription.endpoint.resolve(action).url,
            status: None,
            at: self.clock.now(),
        };

        let outcome = match notification::build_request(subscription, resource, action, document) {
            Ok(request) => {
                record.url.clone_from(&request.url);
                match self.client.deliver(&request).await {
                    Ok(response) => notification::classify(&subscription.delivery, &response),
                    Err(error) => Err(error),
                }
            },
            Err(error) => Err(error),
        };
        record.at = self.clock.now();

        match outcome {
            Ok(NotificationOutcome::Delivered { status }) => {
                record.status = Some(status);
                self.events.handle_event(NotificationEvent::Delivered(record)).await;
                Ok(())
            },
            Ok(NotificationOutcome::Discarded { status }) => {
                record.status = Some(status);
                self.events.handle_event(NotificationEvent::Discarded(record)).await;
                Ok(())
            },
            Err(error) => {
                record.status = error.status_code();
                self.events
                    .handle_event(NotificationEvent::Failed {
                        record,
                        error: error.to_string(),
                        retryable: error.is_retryable(),
                    })
                    .await;
                Err(error)
            },
        }
    }
}

fn skip_missing<T>(result: herald_core::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(CoreError::NotFound(_)) => Ok(None),
        Err(error) => Err(error.into()),
    }
}

#[async_trait]
impl MessageHandler for DeliveryStage {
    async fn handle(&self, payload: Bytes) -> Result<()> {
        let message: DeliveryMessage = messages::decode(&payload)?;
        within_deadline("delivery", self.deadline, self.process(message)).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Mutex};

    use chrono::Utc;
    use herald_core::{
        models::{ChangeDetection, ContentOptions, DeliveryPolicy},
        storage::StoreConfig,
        DocumentId, Endpoint, PartitionId, ResourceId, SkipReason, SubscriptionId, TestClock,
    };
    use serde_json::json;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    #[derive(Debug, Default)]
    struct Recorder(Mutex<Vec<NotificationEvent>>);

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle_event(&self, event: NotificationEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    struct Fixture {
        stage: DeliveryStage,
        storage: Storage,
        events: Arc<Recorder>,
        subscription: Subscription,
        resource: Resource,
    }

    async fn fixture(server: &MockServer) -> Fixture {
        let clock = Arc::new(TestClock::new());
        let storage = Storage::memory(StoreConfig::default(), clock.clone());
        let events = Arc::new(Recorder::default());
        let stage = DeliveryStage::new(
            storage.clone(),
            Arc::new(DeliveryClient::with_defaults().unwrap()),
            events.clone(),
            clock,
            Duration::from_secs(5),
        );

        let resource = Resource {
            id: ResourceId::new(),
            addresses: vec!["https://api.example.com".to_string()],
            path: "/users/{id}".to_string(),
            change: ChangeDetection { field: "seq".to_string(), format: String::new() },
            partitions: BTreeMap::new(),
            created_at: Utc::now(),
        };
        storage.resources.create(&resource).await.unwrap();

        let subscription = Subscription {
            id: SubscriptionId::new(),
            resource_id: resource.id,
            partition: PartitionId::new(),
            endpoint: Endpoint::new(format!("{}/hooks/{{id}}", server.uri())),
            delivery: DeliveryPolicy::default(),
            content: ContentOptions::default(),
            data: Default::default(),
            created_at: Utc::now(),
        };
        storage.subscriptions.create(&subscription).await.unwrap();

        Fixture { stage, storage, events, subscription, resource }
    }

    impl Fixture {
        async fn store(&self, seq: i64) {
            let document = Document {
                id: DocumentId::from("https://api.example.com/users/42"),
                resource_id: self.resource.id,
                content: json!({"seq": seq}).as_object().cloned().unwrap(),
                revision: seq,
                updated_at: Utc::now(),
            };
            self.storage.documents.upsert(document).await.unwrap();
        }

        fn message(&self, action: Action) -> DeliveryMessage {
            DeliveryMessage {
                action,
                document_id: DocumentId::from("https://api.example.com/users/42"),
                resource_id: self.resource.id,
                partition: self.subscription.partition,
                subscription_id: self.subscription.id,
            }
        }

        fn events(&self) -> Vec<NotificationEvent> {
            self.events.0.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn create_is_delivered_once() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/hooks/42"))
            .and(matchers::header("X-Herald-Action", "create"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let fx = fixture(&server).await;
        fx.store(1).await;

        let first = fx.stage.process(fx.message(Action::Create)).await.unwrap();
        let replay = fx.stage.process(fx.message(Action::Create)).await.unwrap();

        assert_eq!(first, Some(TriggerOutcome::Delivered { action: Action::Create, revision: 1 }));
        assert_eq!(
            replay,
            Some(TriggerOutcome::Skipped(SkipReason::NotNewer { last: 1, current: 1 }))
        );
        assert!(matches!(fx.events()[0], NotificationEvent::Delivered(ref r) if r.status == Some(200)));
    }

    #[tokio::test]
    async fn failed_notification_surfaces_error_and_event() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let fx = fixture(&server).await;
        fx.store(1).await;

        let error = fx.stage.process(fx.message(Action::Update)).await.unwrap_err();

        assert!(matches!(error, DeliveryError::UnexpectedStatus { status_code: 503, .. }));
        assert!(error.is_retryable());
        assert!(matches!(
            fx.events()[0],
            NotificationEvent::Failed { ref record, retryable: true, .. }
                if record.status == Some(503) && record.url.ends_with("/hooks/42")
        ));
    }

    #[tokio::test]
    async fn discard_codes_count_as_delivered() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(410))
            .expect(1)
            .mount(&server)
            .await;

        let mut fx = fixture(&server).await;
        fx.subscription.delivery.discard_codes = vec![410];
        fx.storage.subscriptions.delete(fx.subscription.id).await.unwrap();
        fx.storage.subscriptions.create(&fx.subscription).await.unwrap();
        fx.store(1).await;

        fx.stage.process(fx.message(Action::Create)).await.unwrap();
        let replay = fx.stage.process(fx.message(Action::Create)).await.unwrap();

        assert!(matches!(replay, Some(TriggerOutcome::Skipped(SkipReason::NotNewer { .. }))));
        assert!(matches!(fx.events()[0], NotificationEvent::Discarded(_)));
    }

    #[tokio::test]
    async fn delete_of_vanished_document_uses_tombstone() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let fx = fixture(&server).await;
        fx.store(3).await;
        fx.stage.process(fx.message(Action::Create)).await.unwrap();
        fx.storage
            .documents
            .delete(&DocumentId::from("https://api.example.com/users/42"))
            .await
            .unwrap();

        let outcome = fx.stage.process(fx.message(Action::Delete)).await.unwrap();

        assert_eq!(outcome, Some(TriggerOutcome::Delivered { action: Action::Delete, revision: 3 }));
    }

    #[tokio::test]
    async fn update_of_vanished_document_is_skipped() {
        let server = MockServer::start().await;
        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let fx = fixture(&server).await;

        assert_eq!(fx.stage.process(fx.message(Action::Update)).await.unwrap(), None);
        assert!(matches!(fx.events()[0], NotificationEvent::Skipped { .. }));
    }

    #[tokio::test]
    async fn vanished_subscription_is_skipped() {
        let server = MockServer::start().await;
        let fx = fixture(&server).await;
        fx.store(1).await;
        fx.storage.subscriptions.delete(fx.subscription.id).await.unwrap();

        assert_eq!(fx.stage.process(fx.message(Action::Create)).await.unwrap(), None);
        assert!(fx.events().is_empty());
    }
}
