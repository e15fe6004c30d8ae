//! HTTP request handlers for the Herald API.
//!
//! Handlers are grouped by functionality:
//! - `health` - health check for probes and load balancers
//! - `resources` - resource registration
//! - `subscriptions` - subscription registration and removal
//! - `documents` - document ingestion and deletion
//!
//! Failures are returned as [`ApiError`](crate::ApiError) JSON bodies.

pub mod documents;
pub mod health;
pub mod resources;
pub mod subscriptions;

pub use documents::{delete_document, ingest_document};
pub use health::health_check;
pub use resources::{create_resource, get_resource};
pub use subscriptions::{create_subscription, delete_subscription, get_subscription};
