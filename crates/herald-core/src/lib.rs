//! Core domain model and routing primitives for Herald.
//!
//! Provides the wildcard template language, the resource resolver, revision
//! derivation, the delivery ledger and the repository seams every other crate
//! depends on. Nothing in here performs network I/O; delivery and queueing
//! live in `herald-delivery`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod ledger;
pub mod models;
pub mod resolver;
pub mod retry;
pub mod revision;
pub mod storage;
pub mod time;
pub mod wildcard;

pub use error::{CoreError, Result};
pub use events::{
    EventHandler, MulticastEventHandler, NoOpEventHandler, NotificationEvent, NotificationRecord,
    TracingEventHandler,
};
pub use ledger::{DeliverFn, LedgerEntry, LedgerKey, SkipReason, TriggerOutcome};
pub use models::{
    Action, ChangeDetection, ContentOptions, DeliveryPolicy, Document, DocumentId, Endpoint,
    EndpointOverride, PartitionId, Resource, ResourceId, Subscription, SubscriptionId,
};
pub use revision::Revision;
pub use time::{Clock, RealClock, TestClock};
