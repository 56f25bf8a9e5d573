//! Orchestrator tying the watcher, the storage events and the work manager

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use gbsync_core::{Client, EventStream, GbFile, SyncEvent};

use crate::employee::Employee;
use crate::error::{Result, SyncError};
use crate::metrics::SyncMetrics;
use crate::reconcile::{DiskTree, ReconcileReport, Reconciler};
use crate::watcher::{
    FileSystemWatcher, WatchEvent, WatcherOptions, DEFAULT_GRACE_PERIOD, DEFAULT_PAIR_WINDOW,
};
use crate::work::{Work, WorkKind, WorkOrigin};
use crate::work_manager::{WorkManager, WorkManagerOptions, WorkStats, DEFAULT_MAX_CONCURRENCY};

/// Options for the sync engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Local directory kept in sync with the storage root
    pub root: PathBuf,
    /// Maximum number of work items executing at once
    pub max_concurrency: usize,
    /// How long the engine's own writes keep being ignored after they finish
    pub grace_period: Duration,
    /// How long a rename half waits for its counterpart
    pub pair_window: Duration,
    /// Last storage event already processed, if any
    pub last_event_id: Option<u64>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            grace_period: DEFAULT_GRACE_PERIOD,
            pair_window: DEFAULT_PAIR_WINDOW,
            last_event_id: None,
        }
    }
}

impl SyncOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn watcher_options(&self) -> WatcherOptions {
        WatcherOptions {
            grace_period: self.grace_period,
            pair_window: self.pair_window,
        }
    }

    pub fn work_manager_options(&self) -> WorkManagerOptions {
        WorkManagerOptions {
            max_concurrency: self.max_concurrency,
        }
    }
}

/// Everything the dispatcher consumes
#[derive(Debug, Clone)]
pub enum SyncInput {
    Local(WatchEvent),
    Remote(SyncEvent),
}

/// Engine state as reported to hosts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub syncing: bool,
    pub last_event_id: Option<u64>,
    pub stats: WorkStats,
    pub current_works: Vec<Work>,
    pub failed_works: Vec<Work>,
}

/// Turns inputs into work. Shared with the dispatcher task.
#[derive(Clone)]
struct Router {
    root: PathBuf,
    work_manager: WorkManager,
    metrics: Arc<SyncMetrics>,
    /// 0 until an event was heard; storage ids start at 1
    last_event_id: Arc<AtomicU64>,
}

impl Router {
    fn route(&self, input: SyncInput) {
        if let Some(work) = self.work_for(input) {
            self.work_manager.add_work(work);
        }
    }

    fn work_for(&self, input: SyncInput) -> Option<Work> {
        match input {
            SyncInput::Local(event) => {
                self.metrics.record_watch_event(&event);
                self.local_work(event)
            }
            SyncInput::Remote(event) => {
                self.metrics.record_remote_event(event.kind);
                self.last_event_id.fetch_max(event.id, Ordering::AcqRel);
                if event.relative_file.is_root() {
                    debug!(event_id = event.id, kind = %event.kind, "Dropping storage event for the root");
                    return None;
                }
                debug!(event_id = event.id, kind = %event.kind, path = %event.relative_file, "Storage event");
                Some(Work::from_event(&event))
            }
        }
    }

    fn relative(&self, path: &Path) -> Option<GbFile> {
        let file = GbFile::from_local_path(&self.root, path);
        if file.is_none() {
            debug!(path = %path.display(), "Ignoring change outside the sync root");
        }
        file.filter(|file| !file.is_root())
    }

    fn local_work(&self, event: WatchEvent) -> Option<Work> {
        let work = match event {
            WatchEvent::Created(path) | WatchEvent::Modified(path) => {
                Work::new(WorkKind::Upload, self.relative(&path)?)
            }
            WatchEvent::Deleted(path) => Work::new(WorkKind::RemoveInStorage, self.relative(&path)?),
            WatchEvent::Moved { before, after } => {
                match (self.relative(&before), self.relative(&after)) {
                    (Some(before), Some(after)) => Work::moved(WorkKind::MoveInStorage, before, after),
                    (None, Some(after)) => Work::new(WorkKind::Upload, after),
                    (Some(before), None) => Work::new(WorkKind::RemoveInStorage, before),
                    (None, None) => return None,
                }
            }
        };
        Some(work.with_origin(WorkOrigin::Watcher))
    }
}

struct Dispatcher {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Keeps a local directory converged with the storage
pub struct SyncEngine {
    options: SyncOptions,
    root: PathBuf,
    client: Arc<dyn Client>,
    watcher: Arc<FileSystemWatcher>,
    router: Router,
    syncing: AtomicBool,
    dispatcher: Mutex<Option<Dispatcher>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl SyncEngine {
    /// Build an engine for `options.root`. Must be called inside a tokio
    /// runtime.
    pub fn new(client: Arc<dyn Client>, options: SyncOptions) -> Result<Self> {
        let root = std::fs::canonicalize(&options.root)
            .map_err(|e| SyncError::path_error(&options.root, format!("sync root unusable: {}", e)))?;
        if !root.is_dir() {
            return Err(SyncError::path_error(&root, "sync root is not a directory"));
        }

        let metrics = Arc::new(SyncMetrics::new());
        let watcher = Arc::new(FileSystemWatcher::new(&root, options.watcher_options()));
        let employee = Employee::new(client.clone(), &root, watcher.ignore_registry());
        let work_manager = WorkManager::new(
            Arc::new(employee),
            options.work_manager_options(),
            metrics.clone(),
        )?;

        let router = Router {
            root: root.clone(),
            work_manager,
            metrics,
            last_event_id: Arc::new(AtomicU64::new(options.last_event_id.unwrap_or(0))),
        };

        info!(
            root = %root.display(),
            client_id = client.client_id(),
            max_concurrency = options.max_concurrency,
            "Sync engine created"
        );
        Ok(Self {
            options,
            root,
            client,
            watcher,
            router,
            syncing: AtomicBool::new(false),
            dispatcher: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Reconcile, then follow both sides until [`shutdown`](Self::shutdown)
    #[instrument(skip_all, fields(root = %self.root.display()))]
    pub async fn sync_and_start(&self) -> Result<ReconcileReport> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.syncing.swap(true, Ordering::AcqRel) {
            warn!("Sync engine is already running");
            return Ok(ReconcileReport::default());
        }

        match self.start_locked().await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.syncing.store(false, Ordering::Release);
                self.stop_watcher().await;
                self.router.work_manager.shutdown();
                Err(e)
            }
        }
    }

    async fn start_locked(&self) -> Result<ReconcileReport> {
        self.router.work_manager.start();

        // Both feeds open before the walk reads anything. What they deliver
        // meanwhile waits in their channels until the walk's work is queued.
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        self.watcher.start(local_tx)?;
        let remote = self.client.subscribe(self.last_event_id()).await?;

        let report = self.reconcile().await;
        self.spawn_dispatcher(local_rx, remote);

        info!(
            uploads = report.uploads,
            downloads = report.downloads,
            last_event_id = ?self.last_event_id(),
            "Sync engine started"
        );
        Ok(report)
    }

    async fn reconcile(&self) -> ReconcileReport {
        let tree = DiskTree::new(&self.root);
        let outcome = Reconciler::new(self.client.as_ref(), &tree)
            .check_r(GbFile::root())
            .await;
        self.router.metrics.record_reconcile_pass();
        for work in outcome.works {
            self.router.work_manager.add_work(work);
        }
        outcome.report
    }

    /// One reconciliation pass without following changes; returns once the
    /// resulting work is drained.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_syncing() {
            return Err(SyncError::Generic(anyhow::anyhow!(
                "cannot run a single pass while the engine is running"
            )));
        }
        self.router.work_manager.start();
        let report = self.reconcile().await;
        self.router.work_manager.wait_idle().await;
        Ok(report)
    }

    fn spawn_dispatcher(
        &self,
        mut local_rx: mpsc::UnboundedReceiver<WatchEvent>,
        mut remote_rx: EventStream,
    ) {
        let cancel = CancellationToken::new();
        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<SyncInput>();

        let local_tx = input_tx.clone();
        let local_cancel = cancel.clone();
        let local = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = local_cancel.cancelled() => break,
                    event = local_rx.recv() => match event {
                        Some(event) => {
                            if local_tx.send(SyncInput::Local(event)).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        let remote_cancel = cancel.clone();
        let remote = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = remote_cancel.cancelled() => break,
                    event = remote_rx.recv() => match event {
                        Some(event) => {
                            if input_tx.send(SyncInput::Remote(event)).is_err() {
                                break;
                            }
                        }
                        None => {
                            warn!("Storage event stream ended");
                            break;
                        }
                    },
                }
            }
        });

        let router = self.router.clone();
        let dispatch_cancel = cancel.clone();
        let dispatch = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = dispatch_cancel.cancelled() => break,
                    input = input_rx.recv() => match input {
                        Some(input) => router.route(input),
                        None => break,
                    },
                }
            }
            debug!("Dispatcher stopped");
        });

        *self.dispatcher.lock() = Some(Dispatcher {
            cancel,
            tasks: vec![local, remote, dispatch],
        });
    }

    /// Stop following changes and drop work that has not started
    #[instrument(skip_all, fields(root = %self.root.display()))]
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.syncing.swap(false, Ordering::AcqRel) {
            return;
        }

        self.stop_watcher().await;
        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.cancel.cancel();
            for task in dispatcher.tasks {
                if let Err(e) = task.await {
                    warn!("Dispatcher task ended abnormally: {}", e);
                }
            }
        }
        self.router.work_manager.shutdown();
        info!(last_event_id = ?self.last_event_id(), "Sync engine stopped");
    }

    /// Joins the watcher thread on the blocking pool
    async fn stop_watcher(&self) {
        let watcher = self.watcher.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || watcher.stop()).await {
            warn!("Stopping the file watcher failed: {}", e);
        }
    }

    /// Start or stop; a no-op when already in the requested state
    pub async fn set_syncing(&self, syncing: bool) -> Result<()> {
        match (syncing, self.is_syncing()) {
            (true, false) => self.sync_and_start().await.map(|_| ()),
            (false, true) => {
                self.shutdown().await;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub fn current_works(&self) -> Vec<Work> {
        self.router.work_manager.current_works()
    }

    pub fn failed_works(&self) -> Vec<Work> {
        self.router.work_manager.failed_works()
    }

    pub fn last_event_id(&self) -> Option<u64> {
        match self.router.last_event_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn metrics(&self) -> Arc<SyncMetrics> {
        self.router.metrics.clone()
    }

    pub fn work_manager(&self) -> &WorkManager {
        &self.router.work_manager
    }

    /// Resolves once no work is queued or running
    pub async fn wait_idle(&self) {
        self.router.work_manager.wait_idle().await;
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            syncing: self.is_syncing(),
            last_event_id: self.last_event_id(),
            stats: self.router.work_manager.stats(),
            current_works: self.current_works(),
            failed_works: self.failed_works(),
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.cancel.cancel();
        }
    }
}
