//! The three queued stages a change passes through.
//!
//! ```text
//! ingest ──▶ [partition queue] ──▶ PartitionStage ──▶ [spread queue]
//!                                                          │
//!          [delivery queue] ◀── SpreadStage ◀──────────────┘
//!                 │
//!                 ▼
//!          DeliveryStage ──▶ ledger ──▶ HTTP
//! ```
//!
//! Every stage is a `push` + `process` pair. `process` runs under the
//! stage deadline; when it is hit the in-flight future is dropped and the
//! message is left to the queue's redelivery policy.

use std::{future::Future, time::Duration};

use crate::error::{DeliveryError, Result};

pub mod delivery;
pub mod fanout;
pub mod ingest;
pub mod messages;
pub mod partition;
pub mod spread;

pub use delivery::DeliveryStage;
pub use fanout::TaskGroup;
pub use ingest::Ingestor;
pub use messages::{DeliveryMessage, PartitionMessage, SpreadMessage};
pub use partition::PartitionStage;
pub use spread::SpreadStage;

/// Runs a stage invocation, failing with `DeadlineExceeded` when it takes
/// longer than `deadline`.
pub(crate) async fn within_deadline<T, F>(
    stage: &'static str,
    deadline: Duration,
    future: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(deadline, future)
        .await
        .map_err(|_| DeliveryError::deadline_exceeded(stage, deadline))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deadline_drops_slow_invocations() {
        let result = within_deadline("spread", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(DeliveryError::DeadlineExceeded { stage: "spread", .. })));
    }

    #[tokio::test]
    async fn fast_invocations_pass_through() {
        let value = within_deadline("partition", Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(value.unwrap(), 7);
    }
}
