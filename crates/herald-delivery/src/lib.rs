//! Change-trigger pipeline and webhook delivery for Herald.
//!
//! Every accepted document change travels through three queued stages before
//! any callback is made:
//!
//! 1. **Partition** - look up the partitions of the document's resource and
//!    fan the change out, one message per partition
//! 2. **Spread** - stream the subscriptions of a partition and fan out again,
//!    one message per subscription
//! 3. **Delivery** - run the ledger decision for the (subscription, document)
//!    pair and, when it calls for one, send the webhook
//!
//! Stages exchange small JSON envelopes over an at-least-once [`Queue`]. A
//! failing stage invocation leaves its message to the queue's redelivery
//! policy; the ledger guarantees replays never produce duplicate callbacks.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use herald_core::{storage::{Storage, StoreConfig}, RealClock, TracingEventHandler};
//! use herald_delivery::{DeliveryError, PipelineConfig, PipelineEngine};
//!
//! # async fn example() -> std::result::Result<(), DeliveryError> {
//! let clock = Arc::new(RealClock::new());
//! let storage = Storage::memory(StoreConfig::default(), clock.clone());
//! let mut engine = PipelineEngine::new(
//!     storage,
//!     PipelineConfig::default(),
//!     clock,
//!     Arc::new(TracingEventHandler),
//! )?;
//!
//! engine.start().await?;
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod engine;
pub mod error;
pub mod notification;
pub mod pipeline;
pub mod queue;
pub mod retry;
mod worker;
mod worker_pool;

pub use client::{ClientConfig, DeliveryClient, DeliveryResponse, NotificationRequest};
pub use engine::{EngineStats, PipelineConfig, PipelineEngine, PipelineQueueStats};
pub use error::{DeliveryError, Result};
pub use notification::NotificationOutcome;
pub use pipeline::ingest::{IngestOutcome, Ingestor};
pub use queue::{MemoryQueue, MessageHandler, Queue, QueueStats};
pub use retry::RedeliveryPolicy;

/// Default number of workers per stage.
pub const DEFAULT_WORKER_COUNT: usize = 2;

/// Default bound on concurrent pushes inside one fan-out.
pub const DEFAULT_FANOUT_CONCURRENCY: usize = 16;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Default deadline for one stage invocation in seconds.
pub const DEFAULT_STAGE_DEADLINE_SECONDS: u64 = 60;
