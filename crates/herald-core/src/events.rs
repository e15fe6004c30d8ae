//! Notification outcome events.
//!
//! The delivery stage publishes one [`NotificationEvent`] per ledger decision
//! so observers (logging, metrics, audit sinks) can follow outcomes without
//! the pipeline knowing about them.
//!
//! ```text
//! ┌────────────────┐  Delivered/Discarded/  ┌────────────────────┐
//! │ Delivery stage │ ─────Failed/Skipped───▶│ MulticastHandler   │
//! └────────────────┘                        └────────────────────┘
//!                                                     │
//!                                                     ▼
//!                                           TracingEventHandler, ...
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Action, DocumentId, SubscriptionId};

/// Facts about one outbound notification attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    /// Subscription notified.
    pub subscription_id: SubscriptionId,

    /// Document the notification is about.
    pub document_id: DocumentId,

    /// Action delivered after ledger resolution.
    pub action: Action,

    /// Revision carried by the notification.
    pub revision: i64,

    /// Final URL after templating.
    pub url: String,

    /// HTTP status code if the endpoint responded.
    pub status: Option<u16>,

    /// When the attempt finished.
    pub at: DateTime<Utc>,
}

/// Events emitted by the delivery stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NotificationEvent {
    /// Endpoint answered with a success code.
    Delivered(NotificationRecord),

    /// Endpoint answered with a discard code; the ledger still advances.
    Discarded(NotificationRecord),

    /// Delivery failed.
    Failed {
        /// Attempt details
        record: NotificationRecord,
        /// Rendered error
        error: String,
        /// Whether the queue will redeliver
        retryable: bool,
    },

    /// Ledger decided no callback was needed.
    Skipped {
        /// Subscription evaluated
        subscription_id: SubscriptionId,
        /// Document evaluated
        document_id: DocumentId,
        /// Human-readable reason
        reason: String,
    },
}

impl NotificationEvent {
    /// Subscription the event belongs to.
    pub fn subscription_id(&self) -> SubscriptionId {
        match self {
            Self::Delivered(record) | Self::Discarded(record) => record.subscription_id,
            Self::Failed { record, .. } => record.subscription_id,
            Self::Skipped { subscription_id, .. } => *subscription_id,
        }
    }
}

/// Trait for reacting to notification outcomes.
///
/// Handlers must not block delivery; failures are logged, never propagated.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles a notification event.
    async fn handle_event(&self, event: NotificationEvent);
}

/// Event handler that discards all events.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op event handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: NotificationEvent) {}
}

/// Event handler that writes every outcome to `tracing`.
#[derive(Debug, Default)]
pub struct TracingEventHandler;

#[async_trait::async_trait]
impl EventHandler for TracingEventHandler {
    async fn handle_event(&self, event: NotificationEvent) {
        match event {
            NotificationEvent::Delivered(record) => {
                tracing::info!(
                    subscription_id = %record.subscription_id,
                    document_id = %record.document_id,
                    action = %record.action,
                    revision = record.revision,
                    status = ?record.status,
                    "notification delivered"
                );
            },
            NotificationEvent::Discarded(record) => {
                tracing::info!(
                    subscription_id = %record.subscription_id,
                    document_id = %record.document_id,
                    action = %record.action,
                    status = ?record.status,
                    "notification discarded by endpoint"
                );
            },
            NotificationEvent::Failed { record, error, retryable } => {
                tracing::warn!(
                    subscription_id = %record.subscription_id,
                    document_id = %record.document_id,
                    action = %record.action,
                    url = %record.url,
                    status = ?record.status,
                    retryable,
                    error = %error,
                    "notification failed"
                );
            },
            NotificationEvent::Skipped { subscription_id, document_id, reason } => {
                tracing::debug!(
                    subscription_id = %subscription_id,
                    document_id = %document_id,
                    reason = %reason,
                    "notification skipped"
                );
            },
        }
    }
}

/// Event handler that forwards events to multiple subscribers concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a new multicast handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: NotificationEvent) {
        let futures = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move {
                handler.handle_event(event).await;
            }
        });

        futures::future::join_all(futures).await;
    }
}
