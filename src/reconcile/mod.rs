//! Reconcile loop host
//!
//! A deduplicating work queue drained by a fixed worker pool. Keys are
//! `namespace/name` identities; a key added while being processed is marked
//! dirty and redelivered once the in-flight pass finishes, so no state change
//! is lost and no key is ever processed concurrently. Failures are requeued
//! according to the error's classification with per-key exponential backoff.

use crate::error::{Error, ErrorAction, Result};
use futures::future::join_all;
use parking_lot::Mutex;
use prometheus::{IntCounterVec, Opts};
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Workers per controller
pub const DEFAULT_WORKERS: usize = 5;

/// Failure requeue backoff: base doubling per consecutive failure, capped
pub const REQUEUE_BASE: Duration = Duration::from_millis(500);
pub const REQUEUE_CAP: Duration = Duration::from_secs(15 * 60);

// =============================================================================
// Work Queue
// =============================================================================

struct QueueInner<K> {
    queue: VecDeque<K>,
    /// Keys waiting for (re)delivery, including those currently processing
    dirty: HashSet<K>,
    /// Keys a worker currently holds
    processing: HashSet<K>,
    shutdown: bool,
}

/// Deduplicating work queue with the mark-dirty redelivery discipline.
pub struct WorkQueue<K> {
    inner: Mutex<QueueInner<K>>,
    notify: Notify,
}

impl<K: Eq + Hash + Clone> WorkQueue<K> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutdown: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue a key. Duplicate adds collapse; adds against an in-flight key
    /// are redelivered after the current pass completes.
    pub fn add(&self, key: K) {
        let mut inner = self.inner.lock();
        if inner.shutdown || inner.dirty.contains(&key) {
            return;
        }
        inner.dirty.insert(key.clone());
        if !inner.processing.contains(&key) {
            inner.queue.push_back(key);
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Take the next key, waiting until one is available. Returns `None` once
    /// the queue is shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
                if inner.shutdown {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Mark a delivered key finished, redelivering it if it went dirty while
    /// in flight.
    pub fn done(&self, key: &K) {
        let mut inner = self.inner.lock();
        inner.processing.remove(key);
        if inner.dirty.contains(key) && !inner.shutdown {
            inner.queue.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shut_down(&self) {
        self.inner.lock().shutdown = true;
        self.notify.notify_waiters();
    }
}

impl<K: Eq + Hash + Clone> Default for WorkQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Failure Tracking
// =============================================================================

/// Per-key consecutive failure counts driving the requeue backoff.
struct FailureTracker {
    counts: Mutex<HashMap<String, u32>>,
}

impl FailureTracker {
    fn new() -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Record one more failure and return the delay before redelivery.
    fn next_delay(&self, key: &str) -> Duration {
        let mut counts = self.counts.lock();
        let n = counts.entry(key.to_string()).or_insert(0);
        let delay = REQUEUE_BASE
            .saturating_mul(1u32.checked_shl(*n).unwrap_or(u32::MAX))
            .min(REQUEUE_CAP);
        *n = n.saturating_add(1);
        delay
    }

    fn forget(&self, key: &str) {
        self.counts.lock().remove(key);
    }
}

// =============================================================================
// Host
// =============================================================================

/// One controller's reconcile entry point.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Controller name for logs and metrics
    fn name(&self) -> &'static str;

    /// Drive the object behind `key` toward its desired state.
    async fn reconcile(&self, key: &str) -> Result<()>;
}

/// Runs one reconciler over a work queue with a fixed worker pool.
pub struct ReconcileHost {
    queue: Arc<WorkQueue<String>>,
    reconciler: Arc<dyn Reconciler>,
    failures: Arc<FailureTracker>,
    workers: usize,
    results: IntCounterVec,
}

impl ReconcileHost {
    pub fn new(reconciler: Arc<dyn Reconciler>, workers: usize) -> Result<Self> {
        let results = IntCounterVec::new(
            Opts::new(
                "reconcile_results_total",
                "Reconcile pass outcomes by controller",
            ),
            &["controller", "outcome"],
        )
        .map_err(|e| Error::Fatal(e.to_string()))?;
        // Registration fails when another host already registered the family;
        // the counter still works either way.
        let _ = prometheus::register(Box::new(results.clone()));
        Ok(Self {
            queue: Arc::new(WorkQueue::new()),
            reconciler,
            failures: Arc::new(FailureTracker::new()),
            workers,
            results,
        })
    }

    /// Handle producers use to enqueue keys.
    pub fn queue(&self) -> Arc<WorkQueue<String>> {
        Arc::clone(&self.queue)
    }

    /// Run the worker pool until cancelled; in-flight passes finish before
    /// return.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let queue = Arc::clone(&self.queue);
            let reconciler = Arc::clone(&self.reconciler);
            let failures = Arc::clone(&self.failures);
            let results = self.results.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker, queue, reconciler, failures, results, cancel).await;
            }));
        }

        cancel.cancelled().await;
        self.queue.shut_down();
        join_all(handles).await;
        info!(controller = self.reconciler.name(), "reconcile host stopped");
    }
}

async fn worker_loop(
    worker: usize,
    queue: Arc<WorkQueue<String>>,
    reconciler: Arc<dyn Reconciler>,
    failures: Arc<FailureTracker>,
    results: IntCounterVec,
    cancel: CancellationToken,
) {
    let controller = reconciler.name();
    loop {
        let key = tokio::select! {
            key = queue.get() => match key {
                Some(key) => key,
                None => return,
            },
            _ = cancel.cancelled() => return,
        };
        debug!(controller, worker, key = %key, "reconciling");

        match reconciler.reconcile(&key).await {
            Ok(()) => {
                failures.forget(&key);
                results.with_label_values(&[controller, "success"]).inc();
            }
            Err(e) => {
                results.with_label_values(&[controller, "failure"]).inc();
                match e.action() {
                    ErrorAction::RequeueWithBackoff => {
                        let delay = failures.next_delay(&key);
                        warn!(
                            controller,
                            key = %key,
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "reconcile failed, requeueing with backoff"
                        );
                        requeue_after(&queue, &cancel, key.clone(), delay);
                    }
                    ErrorAction::RequeueAfter(delay) => {
                        debug!(controller, key = %key, error = %e, "requeueing after fixed delay");
                        requeue_after(&queue, &cancel, key.clone(), delay);
                    }
                    ErrorAction::NoRequeue => {
                        let request_id = e
                            .request_id()
                            .map(|id| format!(" (request id {})", id))
                            .unwrap_or_default();
                        warn!(
                            controller,
                            key = %key,
                            error = %e,
                            "terminal reconcile failure{}", request_id
                        );
                        failures.forget(&key);
                    }
                }
            }
        }
        queue.done(&key);
    }
}

fn requeue_after(
    queue: &Arc<WorkQueue<String>>,
    cancel: &CancellationToken,
    key: String,
    delay: Duration,
) {
    let queue = Arc::clone(queue);
    let cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => queue.add(key),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_queue_deduplicates_pending_adds() {
        let queue: WorkQueue<String> = WorkQueue::new();
        queue.add("a".into());
        queue.add("a".into());
        queue.add("b".into());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert_eq!(queue.get().await.as_deref(), Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_add_during_processing_redelivers_after_done() {
        let queue: WorkQueue<String> = WorkQueue::new();
        queue.add("a".into());
        let key = queue.get().await.unwrap();

        // Arrives while in flight: not delivered concurrently.
        queue.add("a".into());
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_get_parks_until_work_arrives() {
        let queue: Arc<WorkQueue<String>> = Arc::new(WorkQueue::new());
        let mut get = tokio_test::task::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.get().await }
        });
        assert!(get.poll().is_pending());

        queue.add("a".into());
        assert_eq!(get.await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_getters() {
        let queue: Arc<WorkQueue<String>> = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shut_down();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[test]
    fn test_failure_backoff_doubles_and_caps() {
        let tracker = FailureTracker::new();
        assert_eq!(tracker.next_delay("k"), Duration::from_millis(500));
        assert_eq!(tracker.next_delay("k"), Duration::from_secs(1));
        assert_eq!(tracker.next_delay("k"), Duration::from_secs(2));
        for _ in 0..30 {
            tracker.next_delay("k");
        }
        assert_eq!(tracker.next_delay("k"), REQUEUE_CAP);

        tracker.forget("k");
        assert_eq!(tracker.next_delay("k"), Duration::from_millis(500));
    }

    struct FlakyReconciler {
        attempts: AtomicU32,
        fail_first: u32,
        terminal: bool,
    }

    #[async_trait::async_trait]
    impl Reconciler for FlakyReconciler {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn reconcile(&self, _key: &str) -> Result<()> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                if self.terminal {
                    Err(Error::InvalidConfiguration("bad annotation".into()))
                } else {
                    Err(Error::try_again("cloud hiccup"))
                }
            } else {
                Ok(())
            }
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_host_retries_transient_failures() {
        let reconciler = Arc::new(FlakyReconciler {
            attempts: AtomicU32::new(0),
            fail_first: 2,
            terminal: false,
        });
        let host = ReconcileHost::new(reconciler.clone(), 2).unwrap();
        let cancel = CancellationToken::new();
        let queue = host.queue();
        queue.add("prod/web".into());

        let runner = {
            let cancel = cancel.clone();
            tokio::spawn(async move { host.run(cancel).await })
        };
        wait_for(|| reconciler.attempts.load(Ordering::SeqCst) >= 3).await;
        cancel.cancel();
        runner.await.unwrap();
        assert_eq!(reconciler.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_host_drops_terminal_failures() {
        let reconciler = Arc::new(FlakyReconciler {
            attempts: AtomicU32::new(0),
            fail_first: 100,
            terminal: true,
        });
        let host = ReconcileHost::new(reconciler.clone(), 1).unwrap();
        let cancel = CancellationToken::new();
        let queue = host.queue();
        queue.add("prod/web".into());

        let runner = {
            let cancel = cancel.clone();
            tokio::spawn(async move { host.run(cancel).await })
        };
        wait_for(|| reconciler.attempts.load(Ordering::SeqCst) >= 1).await;
        // Give a requeue a chance to happen if one were scheduled.
        tokio::time::sleep(Duration::from_millis(700)).await;
        cancel.cancel();
        runner.await.unwrap();
        assert_eq!(reconciler.attempts.load(Ordering::SeqCst), 1);
    }
}
