//! At-least-once message queues connecting the pipeline stages.
//!
//! A message stays owned by the queue until its handler succeeds. A handler
//! error hands the message to the queue's [`RedeliveryPolicy`]: it either
//! becomes visible again after a backoff delay or is dropped with an error
//! log.
//!
//! [`MemoryQueue`] is the bundled implementation. Capacity bounds the number
//! of unacknowledged messages; `push` waits while the queue is full.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::{
    sync::{Notify, Semaphore},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    error::{DeliveryError, Result},
    retry::{RedeliveryDecision, RedeliveryPolicy},
};

/// Consumer callback for one message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles a payload. An error leaves the message unacknowledged.
    async fn handle(&self, payload: Bytes) -> Result<()>;
}

/// Queue contract shared by every stage.
#[async_trait]
pub trait Queue: Send + Sync + fmt::Debug {
    /// Enqueues a payload.
    async fn push(&self, payload: Bytes) -> Result<()>;

    /// Waits for one message and runs `handler` on it.
    ///
    /// Returns `Ok(false)` when `cancel` fired before a message arrived.
    async fn pull(&self, cancel: &CancellationToken, handler: &dyn MessageHandler)
        -> Result<bool>;
}

#[derive(Debug)]
struct Message {
    payload: Bytes,
    attempts: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Message>,
    delayed: Vec<(Instant, Message)>,
    in_flight: usize,
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) {
        let mut index = 0;
        while index < self.delayed.len() {
            if self.delayed[index].0 <= now {
                let (_, message) = self.delayed.swap_remove(index);
                self.ready.push_back(message);
            } else {
                index += 1;
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(due, _)| *due).min()
    }
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Messages visible to consumers.
    pub ready: usize,
    /// Messages waiting out a redelivery delay.
    pub delayed: usize,
    /// Messages currently being handled.
    pub in_flight: usize,
    /// Messages dropped after failing for good.
    pub dropped: u64,
}

/// In-process queue with delayed redelivery.
pub struct MemoryQueue {
    name: &'static str,
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: Arc<Semaphore>,
    policy: RedeliveryPolicy,
    dropped: AtomicU64,
}

impl MemoryQueue {
    /// Creates a queue holding at most `capacity` unacknowledged messages.
    pub fn new(name: &'static str, capacity: usize, policy: RedeliveryPolicy) -> Self {
        Self {
            name,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: Arc::new(Semaphore::new(capacity.max(1))),
            policy,
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current counters.
    pub fn stats(&self) -> QueueStats {
        let state = self.lock_state();
        QueueStats {
            ready: state.ready.len(),
            delayed: state.delayed.len(),
            in_flight: state.in_flight,
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Returns true when nothing is ready, delayed or in flight.
    pub fn is_idle(&self) -> bool {
        let state = self.lock_state();
        state.ready.is_empty() && state.delayed.is_empty() && state.in_flight == 0
    }

    /// Makes every delayed message visible immediately.
    pub fn release_delayed(&self) -> usize {
        let mut state = self.lock_state();
        let released = state.delayed.len();
        let delayed = std::mem::take(&mut state.delayed);
        state.ready.extend(delayed.into_iter().map(|(_, message)| message));
        drop(state);

        for _ in 0..released {
            self.notify.notify_one();
        }
        released
    }

    /// Handles one message that is visible now, without waiting.
    ///
    /// Returns `Ok(false)` when no message is ready.
    pub async fn pull_ready(&self, handler: &dyn MessageHandler) -> Result<bool> {
        match self.take_ready() {
            Some(message) => {
                self.dispatch(message, handler).await;
                Ok(true)
            },
            None => Ok(false),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_ready(&self) -> Option<Message> {
        let mut state = self.lock_state();
        state.promote_due(Instant::now());
        let message = state.ready.pop_front()?;
        state.in_flight += 1;
        Some(message)
    }

    async fn dispatch(&self, mut message: Message, handler: &dyn MessageHandler) {
        let result = handler.handle(message.payload.clone()).await;

        let mut state = self.lock_state();
        state.in_flight -= 1;

        let Err(error) = result else {
            drop(state);
            self.capacity.add_permits(1);
            return;
        };

        let charged = if error.not_before().is_some() {
            message.attempts
        } else {
            message.attempts + 1
        };

        match self.policy.decide(charged, &error) {
            RedeliveryDecision::Redeliver { delay } => {
                message.attempts = charged;
                warn!(
                    queue = self.name,
                    attempts = message.attempts,
                    delay_ms = delay.as_millis(),
                    error = %error,
                    "message handling failed, scheduling redelivery"
                );
                state.delayed.push((Instant::now() + delay, message));
                drop(state);
                self.notify.notify_one();
            },
            RedeliveryDecision::Drop { reason } => {
                error!(
                    queue = self.name,
                    attempts = charged,
                    error = %error,
                    reason = %reason,
                    "dropping message"
                );
                self.dropped.fetch_add(1, Ordering::Relaxed);
                drop(state);
                self.capacity.add_permits(1);
            },
        }
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn push(&self, payload: Bytes) -> Result<()> {
        let permit = self
            .capacity
            .acquire()
            .await
            .map_err(|e| DeliveryError::queue(format!("{} queue closed: {e}", self.name)))?;
        // Released on acknowledgement or drop, not at end of scope.
        permit.forget();

        self.lock_state().ready.push_back(Message { payload, attempts: 0 });
        self.notify.notify_one();
        debug!(queue = self.name, "message enqueued");
        Ok(())
    }

    async fn pull(
        &self,
        cancel: &CancellationToken,
        handler: &dyn MessageHandler,
    ) -> Result<bool> {
        let message = loop {
            if let Some(message) = self.take_ready() {
                break message;
            }

            let next_due = self.lock_state().next_due();
            tokio::select! {
                () = cancel.cancelled() => return Ok(false),
                () = self.notify.notified() => {},
                () = sleep_until(next_due) => {},
            }
        };

        self.dispatch(message, handler).await;
        Ok(true)
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl fmt::Debug for MemoryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryQueue")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, time::Duration};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Bytes>>,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, payload: Bytes) -> Result<()> {
            self.seen.lock().unwrap().push(payload);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(DeliveryError::network("refused"));
            }
            Ok(())
        }
    }

    fn queue(max_attempts: u32) -> MemoryQueue {
        let policy = RedeliveryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            jitter_factor: 0.0,
        };
        MemoryQueue::new("test", 4, policy)
    }

    #[tokio::test]
    async fn messages_are_handled_in_order() {
        let queue = queue(3);
        let recorder = Recorder::default();
        queue.push(Bytes::from("a")).await.unwrap();
        queue.push(Bytes::from("b")).await.unwrap();

        let cancel = CancellationToken::new();
        assert!(queue.pull(&cancel, &recorder).await.unwrap());
        assert!(queue.pull(&cancel, &recorder).await.unwrap());

        assert_eq!(*recorder.seen.lock().unwrap(), vec![Bytes::from("a"), Bytes::from("b")]);
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn failed_messages_are_redelivered() {
        let queue = queue(3);
        let recorder = Recorder { failures_left: AtomicUsize::new(1), ..Default::default() };
        queue.push(Bytes::from("a")).await.unwrap();

        let cancel = CancellationToken::new();
        queue.pull(&cancel, &recorder).await.unwrap();
        assert_eq!(queue.stats().delayed, 1);

        queue.pull(&cancel, &recorder).await.unwrap();
        assert_eq!(recorder.seen.lock().unwrap().len(), 2);
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn messages_are_dropped_after_max_attempts() {
        let queue = queue(2);
        let recorder = Recorder { failures_left: AtomicUsize::new(10), ..Default::default() };
        queue.push(Bytes::from("a")).await.unwrap();

        assert!(queue.pull_ready(&recorder).await.unwrap());
        assert_eq!(queue.release_delayed(), 1);
        assert!(queue.pull_ready(&recorder).await.unwrap());

        let stats = queue.stats();
        assert_eq!(stats.dropped, 1);
        assert!(queue.is_idle());
        assert!(!queue.pull_ready(&recorder).await.unwrap());
    }

    #[tokio::test]
    async fn pull_returns_false_on_cancellation() {
        let queue = queue(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(!queue.pull(&cancel, &Recorder::default()).await.unwrap());
    }

    #[tokio::test]
    async fn push_waits_while_full() {
        let queue = Arc::new(MemoryQueue::new("small", 1, RedeliveryPolicy::default()));
        queue.push(Bytes::from("a")).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), queue.push(Bytes::from("b")));
        assert!(blocked.await.is_err());

        queue.pull_ready(&Recorder::default()).await.unwrap();
        tokio::time::timeout(Duration::from_millis(50), queue.push(Bytes::from("c")))
            .await
            .expect("capacity released after ack")
            .unwrap();
    }
}
