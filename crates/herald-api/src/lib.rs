//! Herald administrative HTTP API.
//!
//! Registers resources and subscriptions, accepts document snapshots and
//! deletions, and reports service health. Documents are handed to the
//! pipeline through an [`Ingestor`]; everything else talks to [`Storage`]
//! directly.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::{sync::Arc, time::Duration};

use herald_core::{storage::Storage, Clock};
use herald_delivery::Ingestor;

pub mod config;
pub mod error;
pub mod handlers;
pub mod server;

pub use config::{Config, StorageBackend};
pub use error::ApiError;
pub use server::{create_router, shutdown_signal, start_server};

/// Shared state handed to every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Repository handles.
    pub storage: Storage,
    /// Entry point into the pipeline.
    pub ingestor: Ingestor,
    /// Time source for timestamps.
    pub clock: Arc<dyn Clock>,
    /// Per-request timeout enforced by the router.
    pub request_timeout: Duration,
}

impl AppState {
    /// Bundles the handles handlers need.
    pub fn new(storage: Storage, ingestor: Ingestor, clock: Arc<dyn Clock>) -> Self {
        Self { storage, ingestor, clock, request_timeout: server::DEFAULT_REQUEST_TIMEOUT }
    }

    /// Overrides the per-request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}
