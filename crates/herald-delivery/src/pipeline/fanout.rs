//! Bounded, cancelling task groups used by the fan-out stages.
//!
//! At most `limit` tasks run at once; `spawn` waits for a free slot. The
//! first task to fail cancels its siblings and becomes the result of
//! [`TaskGroup::wait`]. A task cut short by cancellation counts as a failure
//! too, but never hides a real one. Dropping the group aborts whatever is
//! still running.

use std::{future::Future, sync::Arc};

use tokio::{
    sync::Semaphore,
    task::{JoinError, JoinSet},
};
use tokio_util::sync::CancellationToken;

use crate::error::{DeliveryError, Result};

/// Group of fan-out tasks sharing a concurrency bound and a cancellation
/// token.
#[derive(Debug)]
pub struct TaskGroup {
    tasks: JoinSet<Option<Result<()>>>,
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
    failure: Option<DeliveryError>,
    interrupted: bool,
    spawned: usize,
}

impl TaskGroup {
    /// Creates a group whose token is a child of `parent`.
    pub fn new(limit: usize, parent: &CancellationToken) -> Self {
        Self {
            tasks: JoinSet::new(),
            slots: Arc::new(Semaphore::new(limit.max(1))),
            cancel: parent.child_token(),
            failure: None,
            interrupted: false,
            spawned: 0,
        }
    }

    /// Number of tasks spawned so far.
    pub fn spawned(&self) -> usize {
        self.spawned
    }

    /// Spawns a task once a slot is free.
    ///
    /// # Errors
    ///
    /// Returns the first failure of an earlier task; nothing is spawned then.
    pub async fn spawn<F>(&mut self, task: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.collect_finished();
        if let Some(error) = self.failure.take() {
            return Err(error);
        }

        let permit = tokio::select! {
            permit = self.slots.clone().acquire_owned() => permit
                .map_err(|e| DeliveryError::queue(format!("fan-out closed: {e}")))?,
            () = self.cancel.cancelled() => {
                self.collect_finished();
                return Err(self.failure.take().unwrap_or_else(cancelled));
            },
        };

        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            let _permit = permit;
            tokio::select! {
                () = cancel.cancelled() => None,
                result = task => {
                    if result.is_err() {
                        cancel.cancel();
                    }
                    Some(result)
                },
            }
        });
        self.spawned += 1;
        Ok(())
    }

    /// Waits for every task; returns the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first task error, `WorkerPanic` if a task panicked, or a
    /// queue error when cancellation stopped a task before it finished.
    pub async fn wait(mut self) -> Result<()> {
        while let Some(joined) = self.tasks.join_next().await {
            self.record(joined);
        }
        match self.failure.take() {
            Some(error) => Err(error),
            None if self.interrupted => Err(cancelled()),
            None => Ok(()),
        }
    }

    fn collect_finished(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            self.record(joined);
        }
    }

    fn record(&mut self, joined: std::result::Result<Option<Result<()>>, JoinError>) {
        let error = match joined {
            Ok(Some(Ok(()))) => return,
            Ok(Some(Err(error))) => error,
            Ok(None) => {
                self.interrupted = true;
                return;
            },
            Err(join_error) if join_error.is_cancelled() => {
                self.interrupted = true;
                return;
            },
            Err(join_error) => DeliveryError::WorkerPanic {
                worker_id: self.spawned,
                error: join_error.to_string(),
            },
        };

        self.cancel.cancel();
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }
}

fn cancelled() -> DeliveryError {
    DeliveryError::queue("fan-out cancelled")
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut group = TaskGroup::new(3, &CancellationToken::new());

        for _ in 0..12 {
            let running = running.clone();
            let peak = peak.clone();
            group
                .spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }

        group.wait().await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn first_failure_cancels_siblings() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut group = TaskGroup::new(4, &CancellationToken::new());

        for i in 0..4 {
            let finished = finished.clone();
            group
                .spawn(async move {
                    if i == 3 {
                        return Err(DeliveryError::network("refused"));
                    }
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }

        let error = tokio::time::timeout(Duration::from_secs(1), group.wait())
            .await
            .expect("siblings cancelled")
            .unwrap_err();
        assert!(matches!(error, DeliveryError::Network { .. }));
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn parent_cancellation_fails_the_group() {
        let parent = CancellationToken::new();
        let finished = Arc::new(AtomicUsize::new(0));
        let mut group = TaskGroup::new(4, &parent);

        for _ in 0..3 {
            let finished = finished.clone();
            group
                .spawn(async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }
        parent.cancel();

        let error = tokio::time::timeout(Duration::from_secs(1), group.wait())
            .await
            .expect("branches stopped")
            .unwrap_err();
        assert!(matches!(error, DeliveryError::Queue { .. }));
        assert!(error.to_string().contains("cancelled"));
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn completed_group_ignores_later_cancellation() {
        let parent = CancellationToken::new();
        let mut group = TaskGroup::new(2, &parent);
        group.spawn(async { Ok(()) }).await.unwrap();
        group.spawn(async { Ok(()) }).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        parent.cancel();

        group.wait().await.unwrap();
    }

    #[tokio::test]
    async fn spawn_after_failure_reports_it() {
        let mut group = TaskGroup::new(1, &CancellationToken::new());
        group.spawn(async { Err(DeliveryError::template("bad")) }).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let error = group.spawn(async { Ok(()) }).await.unwrap_err();
        assert!(matches!(error, DeliveryError::Template { .. }));
    }
}
