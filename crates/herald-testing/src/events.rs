//! Event recording for deterministic assertions on notification outcomes.

use std::{sync::Arc, time::Duration};

use herald_core::{EventHandler, NotificationEvent, NotificationRecord};
use tokio::sync::{Notify, RwLock};

/// Default timeout when waiting for events in tests.
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Event handler that keeps every event it sees.
#[derive(Debug, Default)]
pub struct RecordingEventHandler {
    events: RwLock<Vec<NotificationEvent>>,
    notify: Notify,
}

impl RecordingEventHandler {
    /// Creates an empty recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All events so far, oldest first.
    pub async fn events(&self) -> Vec<NotificationEvent> {
        self.events.read().await.clone()
    }

    /// Records of delivered notifications.
    pub async fn delivered(&self) -> Vec<NotificationRecord> {
        self.events
            .read()
            .await
            .iter()
            .filter_map(|event| match event {
                NotificationEvent::Delivered(record) => Some(record.clone()),
                _ => None,
            })
            .collect()
    }

    /// Records of failed notifications.
    pub async fn failed(&self) -> Vec<NotificationRecord> {
        self.events
            .read()
            .await
            .iter()
            .filter_map(|event| match event {
                NotificationEvent::Failed { record, .. } => Some(record.clone()),
                _ => None,
            })
            .collect()
    }

    /// Skip reasons, oldest first.
    pub async fn skipped(&self) -> Vec<String> {
        self.events
            .read()
            .await
            .iter()
            .filter_map(|event| match event {
                NotificationEvent::Skipped { reason, .. } => Some(reason.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of events so far.
    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    /// Whether nothing was recorded.
    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }

    /// Forgets recorded events.
    pub async fn clear(&self) {
        self.events.write().await.clear();
    }

    /// Waits until at least `count` events were recorded.
    ///
    /// # Panics
    ///
    /// Panics after [`DEFAULT_EVENT_TIMEOUT`].
    pub async fn wait_for(&self, count: usize) {
        let result = tokio::time::timeout(DEFAULT_EVENT_TIMEOUT, async {
            loop {
                let notified = self.notify.notified();
                if self.len().await >= count {
                    return;
                }
                notified.await;
            }
        })
        .await;

        if result.is_err() {
            panic!(
                "events did not arrive in time. expected: {}, actual: {}",
                count,
                self.len().await
            );
        }
    }
}

#[async_trait::async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: NotificationEvent) {
        self.events.write().await.push(event);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use herald_core::{DocumentId, SubscriptionId};

    use super::*;

    #[tokio::test]
    async fn waits_for_events() {
        let recorder = RecordingEventHandler::new();
        let handler: Arc<dyn EventHandler> = recorder.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handler
                .handle_event(NotificationEvent::Skipped {
                    subscription_id: SubscriptionId::new(),
                    document_id: DocumentId::from("/users/1"),
                    reason: "no ledger entry".to_string(),
                })
                .await;
        });

        recorder.wait_for(1).await;
        assert_eq!(recorder.skipped().await, vec!["no ledger entry".to_string()]);
        assert!(recorder.delivered().await.is_empty());
    }
}
