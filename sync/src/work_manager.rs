//! Bounded-concurrency execution of work items

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::metrics::{SyncMetrics, WorkOutcome};
use crate::work::{Work, WorkOrigin, WorkState};

pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Performs one work item
#[async_trait]
pub trait WorkExecutor: Send + Sync + 'static {
    /// Execute `work`, returning the work it derived (directory fan-out)
    async fn execute(&self, work: &Work) -> Result<Vec<Work>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkManagerOptions {
    pub max_concurrency: usize,
}

impl Default for WorkManagerOptions {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

/// Counts of the manager's work, live and finished
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkStats {
    pub queued: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Owns every work item from submission until it ends. Cloning shares the
/// same manager.
#[derive(Clone)]
pub struct WorkManager {
    inner: Arc<Inner>,
}

struct Inner {
    executor: Arc<dyn WorkExecutor>,
    semaphore: Arc<Semaphore>,
    current: Mutex<HashMap<Uuid, Work>>,
    failed: Mutex<Vec<Work>>,
    cancel: Mutex<CancellationToken>,
    runtime: Handle,
    idle: Notify,
    metrics: Arc<SyncMetrics>,
}

impl WorkManager {
    /// Must be called inside a tokio runtime; its handle runs every work.
    pub fn new(
        executor: Arc<dyn WorkExecutor>,
        options: WorkManagerOptions,
        metrics: Arc<SyncMetrics>,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            SyncError::Generic(anyhow::anyhow!("WorkManager needs a tokio runtime: {}", e))
        })?;
        Ok(Self::with_handle(executor, options, metrics, runtime))
    }

    pub fn with_handle(
        executor: Arc<dyn WorkExecutor>,
        options: WorkManagerOptions,
        metrics: Arc<SyncMetrics>,
        runtime: Handle,
    ) -> Self {
        let permits = options.max_concurrency.max(1);
        Self {
            inner: Arc::new(Inner {
                executor,
                semaphore: Arc::new(Semaphore::new(permits)),
                current: Mutex::new(HashMap::new()),
                failed: Mutex::new(Vec::new()),
                cancel: Mutex::new(CancellationToken::new()),
                runtime,
                idle: Notify::new(),
                metrics,
            }),
        }
    }

    /// Queue `work`. Callable from any thread.
    pub fn add_work(&self, work: Work) {
        let token = self.inner.cancel.lock().clone();
        debug!(work_id = %work.id, kind = %work.kind, path = %work.file, "Work queued");

        self.inner.current.lock().insert(work.id, work.clone());
        self.inner.metrics.record_submitted();

        let manager = self.clone();
        self.inner.runtime.spawn(manager.run(work, token));
    }

    /// Wait for a permit and mark `work` running. Fails with
    /// [`SyncError::Cancelled`] when shutdown came first.
    async fn admit(
        &self,
        work: &mut Work,
        token: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit> {
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(SyncError::Cancelled),
            permit = self.inner.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| SyncError::Cancelled)?
            }
        };

        let mut current = self.inner.current.lock();
        if token.is_cancelled() || !current.contains_key(&work.id) {
            return Err(SyncError::Cancelled);
        }
        work.transition(WorkState::Running)?;
        current.insert(work.id, work.clone());
        Ok(permit)
    }

    async fn run(self, mut work: Work, token: CancellationToken) {
        let permit = match self.admit(&mut work, &token).await {
            Ok(permit) => permit,
            Err(SyncError::Cancelled) => {
                self.finish_cancelled(&work);
                return;
            }
            Err(e) => {
                warn!(work_id = %work.id, "Refusing to run work: {}", e);
                self.remove(work.id);
                return;
            }
        };
        self.inner.metrics.record_started();
        debug!(work_id = %work.id, kind = %work.kind, path = %work.file, "Work running");

        let result = self.inner.executor.execute(&work).await;
        drop(permit);

        match result {
            Ok(derived) => {
                // Derived work joins the current set before its parent leaves it
                for child in derived {
                    self.add_work(child.with_origin(WorkOrigin::Derived));
                }
                if let Err(e) = work.transition(WorkState::End) {
                    warn!(work_id = %work.id, "{}", e);
                }
                debug!(work_id = %work.id, kind = %work.kind, path = %work.file, "Work done");
                self.finish(&work, WorkOutcome::Completed);
            }
            Err(error) => {
                warn!(
                    work_id = %work.id,
                    kind = %work.kind,
                    path = %work.file,
                    category = error.category(),
                    "Work failed: {}",
                    error
                );
                if let Err(e) = work.fail(error.to_string()) {
                    warn!(work_id = %work.id, "{}", e);
                }
                self.inner.failed.lock().push(work.clone());
                self.finish(&work, WorkOutcome::Failed);
            }
        }
    }

    fn finish(&self, work: &Work, outcome: WorkOutcome) {
        self.inner
            .metrics
            .record_finished(work.kind, outcome, true);
        self.remove(work.id);
    }

    fn finish_cancelled(&self, work: &Work) {
        debug!(work_id = %work.id, kind = %work.kind, path = %work.file, "Work cancelled");
        self.inner
            .metrics
            .record_finished(work.kind, WorkOutcome::Cancelled, false);
        self.remove(work.id);
    }

    fn remove(&self, id: Uuid) {
        let mut current = self.inner.current.lock();
        current.remove(&id);
        if current.is_empty() {
            self.inner.idle.notify_waiters();
        }
    }

    /// Snapshot of queued and running work, oldest first
    pub fn current_works(&self) -> Vec<Work> {
        let mut works: Vec<Work> = self.inner.current.lock().values().cloned().collect();
        works.sort_by_key(|work| work.created_at);
        works
    }

    pub fn failed_works(&self) -> Vec<Work> {
        self.inner.failed.lock().clone()
    }

    pub fn clear_failed(&self) -> usize {
        let mut failed = self.inner.failed.lock();
        let count = failed.len();
        failed.clear();
        count
    }

    pub fn is_idle(&self) -> bool {
        self.inner.current.lock().is_empty()
    }

    /// Resolves once no work is queued or running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Drop all work that has not started. Running work finishes on its own.
    pub fn shutdown(&self) {
        let mut current = self.inner.current.lock();
        self.inner.cancel.lock().cancel();
        let before = current.len();
        current.retain(|_, work| work.state() == WorkState::Running);
        let dropped = before - current.len();
        if current.is_empty() {
            self.inner.idle.notify_waiters();
        }
        info!(dropped, running = current.len(), "Work manager shut down");
    }

    /// Accept work again after [`shutdown`](Self::shutdown)
    pub fn start(&self) {
        let mut cancel = self.inner.cancel.lock();
        if cancel.is_cancelled() {
            *cancel = CancellationToken::new();
            debug!("Work manager restarted");
        }
    }

    pub fn is_accepting(&self) -> bool {
        !self.inner.cancel.lock().is_cancelled()
    }

    pub fn stats(&self) -> WorkStats {
        let (queued, running) = {
            let current = self.inner.current.lock();
            let running = current
                .values()
                .filter(|work| work.state() == WorkState::Running)
                .count();
            (current.len() - running, running)
        };
        let metrics = &self.inner.metrics;
        WorkStats {
            queued,
            running,
            completed: metrics.total(WorkOutcome::Completed),
            failed: metrics.total(WorkOutcome::Failed),
            cancelled: metrics.total(WorkOutcome::Cancelled),
        }
    }

    pub fn metrics(&self) -> Arc<SyncMetrics> {
        self.inner.metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::WorkKind;
    use gbsync_core::GbFile;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    /// Tracks how many executions overlap
    #[derive(Default)]
    struct CountingExecutor {
        active: AtomicUsize,
        peak: AtomicUsize,
        executed: AtomicUsize,
        delay: Duration,
    }

    impl CountingExecutor {
        fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl WorkExecutor for CountingExecutor {
        async fn execute(&self, work: &Work) -> Result<Vec<Work>> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);
            sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.executed.fetch_add(1, Ordering::SeqCst);

            if work.file.name.starts_with("fail") {
                return Err(SyncError::invalid_work("refused"));
            }
            // A directory fans out into two files
            if work.file.is_directory {
                return Ok(vec![
                    Work::new(work.kind, work.file.child("one", false)),
                    Work::new(work.kind, work.file.child("two", false)),
                ]);
            }
            Ok(Vec::new())
        }
    }

    fn upload(name: &str) -> Work {
        Work::new(WorkKind::Upload, GbFile::root().child(name, false))
    }

    fn manager(executor: Arc<CountingExecutor>, max_concurrency: usize) -> WorkManager {
        WorkManager::new(
            executor,
            WorkManagerOptions { max_concurrency },
            Arc::new(SyncMetrics::new()),
        )
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_is_bounded() {
        let executor = CountingExecutor::with_delay(Duration::from_millis(20));
        let manager = manager(executor.clone(), 3);

        for i in 0..20 {
            manager.add_work(upload(&format!("file{i}")));
        }
        timeout(Duration::from_secs(10), manager.wait_idle()).await.unwrap();

        assert_eq!(executor.executed.load(Ordering::SeqCst), 20);
        assert!(executor.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(manager.stats().completed, 20);
        assert!(manager.is_idle());
    }

    #[tokio::test]
    async fn test_derived_work_is_executed() {
        let executor = CountingExecutor::with_delay(Duration::from_millis(1));
        let manager = manager(executor.clone(), 2);

        manager.add_work(Work::new(
            WorkKind::Download,
            GbFile::root().child("dir", true),
        ));
        timeout(Duration::from_secs(5), manager.wait_idle()).await.unwrap();

        assert_eq!(executor.executed.load(Ordering::SeqCst), 3);
        assert_eq!(manager.stats().completed, 3);
    }

    #[tokio::test]
    async fn test_failures_are_recorded_without_retry() {
        let executor = CountingExecutor::with_delay(Duration::from_millis(1));
        let manager = manager(executor.clone(), 2);

        manager.add_work(upload("fail.txt"));
        manager.add_work(upload("ok.txt"));
        timeout(Duration::from_secs(5), manager.wait_idle()).await.unwrap();

        let failed = manager.failed_works();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].file.name, "fail.txt");
        assert_eq!(failed[0].state(), WorkState::Failed);
        assert!(failed[0].error.as_deref().unwrap().contains("refused"));
        assert_eq!(executor.executed.load(Ordering::SeqCst), 2);
        assert_eq!(manager.stats().failed, 1);

        assert_eq!(manager.clear_failed(), 1);
        assert!(manager.failed_works().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_queued_work() {
        let executor = CountingExecutor::with_delay(Duration::from_millis(200));
        let manager = manager(executor.clone(), 1);

        for i in 0..5 {
            manager.add_work(upload(&format!("file{i}")));
        }
        sleep(Duration::from_millis(50)).await;
        manager.shutdown();

        let remaining = manager.current_works();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].state(), WorkState::Running);
        assert!(!manager.is_accepting());

        timeout(Duration::from_secs(5), manager.wait_idle()).await.unwrap();
        assert_eq!(executor.executed.load(Ordering::SeqCst), 1);
        assert_eq!(manager.stats().cancelled, 4);

        manager.start();
        manager.add_work(upload("after-restart"));
        timeout(Duration::from_secs(5), manager.wait_idle()).await.unwrap();
        assert_eq!(executor.executed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_admit_refuses_after_cancellation() {
        let manager = manager(CountingExecutor::with_delay(Duration::ZERO), 1);
        let mut work = upload("late");
        let initial = work.state();

        // Dropped from the current set by a shutdown
        let live = CancellationToken::new();
        assert!(matches!(manager.admit(&mut work, &live).await, Err(SyncError::Cancelled)));

        manager.inner.current.lock().insert(work.id, work.clone());
        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert!(matches!(manager.admit(&mut work, &cancelled).await, Err(SyncError::Cancelled)));
        assert_eq!(work.state(), initial);

        let _permit = manager.admit(&mut work, &live).await.unwrap();
        assert_eq!(work.state(), WorkState::Running);
    }

    #[tokio::test]
    async fn test_work_added_from_another_thread() {
        let executor = CountingExecutor::with_delay(Duration::from_millis(1));
        let manager = manager(executor.clone(), 2);

        let remote = manager.clone();
        std::thread::spawn(move || remote.add_work(upload("from-thread")))
            .join()
            .unwrap();

        timeout(Duration::from_secs(5), manager.wait_idle()).await.unwrap();
        assert_eq!(executor.executed.load(Ordering::SeqCst), 1);
    }
}
