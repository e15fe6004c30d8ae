//! Test infrastructure for Herald.
//!
//! Provides an in-memory environment running the production pipeline,
//! a mock callback server, fixture builders and an event recorder so
//! pipeline behaviour can be asserted deterministically.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod events;
pub mod fixtures;
pub mod http;

mod env;

pub use env::{TestEnv, TestEnvBuilder};
pub use events::RecordingEventHandler;
pub use fixtures::{DocumentBuilder, ResourceBuilder, SubscriptionBuilder};
pub use herald_core::TestClock;
pub use http::{MockEndpoint, MockResponse, MockServer, RecordedRequest};
