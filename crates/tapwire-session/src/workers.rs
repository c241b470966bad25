//! Cancellable per-connection worker tasks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Cancellation signal handed to each connection worker.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Returns true once the session is stopping.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the session starts stopping.
    pub async fn cancelled(&mut self) {
        // A closed channel means the worker set is gone; treat that as cancelled.
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Result of draining the worker set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// Workers that finished within the drain timeout.
    pub finished: usize,
    /// Workers aborted after the timeout.
    pub aborted: usize,
}

struct WorkersInner {
    tasks: Mutex<JoinSet<()>>,
    cancel: watch::Sender<bool>,
}

/// The set of connection workers spawned during one session.
///
/// Clones share the set.
#[derive(Clone)]
pub struct ConnectionWorkers {
    inner: Arc<WorkersInner>,
}

impl std::fmt::Debug for ConnectionWorkers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionWorkers")
            .field("cancelled", &*self.inner.cancel.borrow())
            .finish()
    }
}

impl Default for ConnectionWorkers {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionWorkers {
    /// Creates an empty worker set.
    pub fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(WorkersInner {
                tasks: Mutex::new(JoinSet::new()),
                cancel,
            }),
        }
    }

    /// Spawns a worker on the current runtime.
    ///
    /// Returns false without spawning once the set is shutting down.
    pub fn spawn<F, Fut>(&self, worker: F) -> bool
    where
        F: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_cancelled() {
            return false;
        }

        let signal = CancelSignal {
            rx: self.inner.cancel.subscribe(),
        };
        let future = worker(signal);

        let mut tasks = self.inner.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(future);
        true
    }

    /// Returns the number of workers still running.
    pub fn active(&self) -> usize {
        let mut tasks = self.inner.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Returns true once shutdown has begun.
    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancel.borrow()
    }

    /// Signals every worker, waits up to `drain` for them, then aborts the rest.
    ///
    /// When this returns no worker task is left running.
    pub async fn shutdown(&self, drain: Duration) -> DrainReport {
        self.inner.cancel.send_replace(true);
        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock());
        let total = tasks.len();

        let drained = tokio::time::timeout(drain, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        let aborted = if drained.is_err() {
            let remaining = tasks.len();
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            remaining
        } else {
            0
        };

        DrainReport {
            finished: total - aborted,
            aborted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn cooperative_workers_drain() {
        let workers = ConnectionWorkers::new();
        let saw_cancel = Arc::new(AtomicBool::new(false));

        let flag = saw_cancel.clone();
        assert!(workers.spawn(move |mut cancel| async move {
            cancel.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        }));
        assert_eq!(workers.active(), 1);

        let report = workers.shutdown(Duration::from_secs(1)).await;
        assert_eq!(report, DrainReport { finished: 1, aborted: 0 });
        assert!(saw_cancel.load(Ordering::SeqCst));
        assert_eq!(workers.active(), 0);
    }

    #[tokio::test]
    async fn stuck_workers_are_aborted() {
        let workers = ConnectionWorkers::new();
        workers.spawn(|_cancel| async move {
            std::future::pending::<()>().await;
        });

        let report = workers.shutdown(Duration::from_millis(20)).await;
        assert_eq!(report.aborted, 1);
        assert_eq!(workers.active(), 0);
    }

    #[tokio::test]
    async fn no_spawns_after_shutdown() {
        let workers = ConnectionWorkers::new();
        workers.shutdown(Duration::ZERO).await;
        assert!(workers.is_cancelled());
        assert!(!workers.spawn(|_cancel| async move {}));
        assert_eq!(workers.active(), 0);
    }

    #[tokio::test]
    async fn finished_workers_are_reaped() {
        let workers = ConnectionWorkers::new();
        workers.spawn(|cancel| async move {
            assert!(!cancel.is_cancelled());
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(workers.active(), 0);
    }
}
