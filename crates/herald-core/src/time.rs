//! Time abstractions for testable timing.
//!
//! Ledger retry windows, subscription TTLs and record timestamps all read the
//! injected [`Clock`] instead of the system clock, so tests can move time
//! forward deterministically.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};

/// Clock abstraction for wall-clock reads and sleeps.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Sleeps for the specified duration.
    ///
    /// In production this maps to `tokio::time::sleep`; test clocks advance
    /// virtual time immediately.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Production clock backed by the system time and the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Test clock for deterministic time control.
///
/// Clones share the same underlying time, so a clock handed to a store can be
/// advanced from the test body.
#[derive(Debug, Clone)]
pub struct TestClock {
    /// Wall-clock time as nanoseconds since the UNIX epoch
    nanos: Arc<AtomicI64>,
}

impl TestClock {
    /// Creates a test clock starting at the current time.
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    /// Creates a test clock starting at a specific time.
    pub fn at(start: DateTime<Utc>) -> Self {
        Self { nanos: Arc::new(AtomicI64::new(to_nanos(start))) }
    }

    /// Advances the clock by the given duration.
    pub fn advance(&self, duration: Duration) {
        let delta = i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX);
        self.nanos.fetch_add(delta, Ordering::AcqRel);
    }

    /// Jumps the clock to a specific time, forwards or backwards.
    pub fn set(&self, time: DateTime<Utc>) {
        self.nanos.store(to_nanos(time), Ordering::Release);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.nanos.load(Ordering::Acquire))
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

fn to_nanos(time: DateTime<Utc>) -> i64 {
    time.timestamp_nanos_opt().unwrap_or(i64::MAX)
}
