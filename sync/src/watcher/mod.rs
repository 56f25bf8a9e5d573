//! Filesystem watcher for the sync root
//!
//! Normalizes OS notifications into [`WatchEvent`]s and drops the ones the
//! engine caused itself (see [`IgnoreRegistry`]). Every directory is watched
//! non-recursively; new subtrees are registered as they appear.

pub mod ignore;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use walkdir::WalkDir;

use crate::error::Result;

pub use ignore::{IgnoreGuard, IgnoreRegistry, DEFAULT_GRACE_PERIOD};

/// How long an unpaired rename half waits for its counterpart
pub const DEFAULT_PAIR_WINDOW: Duration = Duration::from_millis(500);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherOptions {
    pub grace_period: Duration,
    pub pair_window: Duration,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            pair_window: DEFAULT_PAIR_WINDOW,
        }
    }
}

/// A normalized filesystem change, with absolute paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
    Moved { before: PathBuf, after: PathBuf },
}

impl WatchEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            WatchEvent::Created(_) => "created",
            WatchEvent::Modified(_) => "modified",
            WatchEvent::Deleted(_) => "deleted",
            WatchEvent::Moved { .. } => "moved",
        }
    }

    /// The path the event leaves behind
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Created(path) | WatchEvent::Modified(path) | WatchEvent::Deleted(path) => {
                path
            }
            WatchEvent::Moved { after, .. } => after,
        }
    }
}

pub struct FileSystemWatcher {
    root: PathBuf,
    options: WatcherOptions,
    ignore: IgnoreRegistry,
    worker: Mutex<Option<Worker>>,
}

struct Worker {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl FileSystemWatcher {
    pub fn new(root: impl Into<PathBuf>, options: WatcherOptions) -> Self {
        Self {
            root: root.into(),
            options,
            ignore: IgnoreRegistry::new(options.grace_period),
            worker: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Registry shared with whoever writes into the watched tree
    pub fn ignore_registry(&self) -> IgnoreRegistry {
        self.ignore.clone()
    }

    pub fn start_ignoring(&self, path: impl Into<PathBuf>) {
        self.ignore.start_ignoring(path);
    }

    pub fn stop_ignoring(&self, path: impl AsRef<Path>) {
        self.ignore.stop_ignoring(path);
    }

    pub fn foresee(&self, path: impl Into<PathBuf>) {
        self.ignore.foresee(path);
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    /// Register the tree and start delivering events into `tx`. Fails only
    /// when the root itself cannot be watched.
    pub fn start(&self, tx: mpsc::UnboundedSender<WatchEvent>) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            warn!("File watcher is already running");
            return Ok(());
        }

        let (raw_tx, raw_rx) = std_mpsc::channel();
        let mut watcher = notify::recommended_watcher(raw_tx)?;
        watcher.watch(&self.root, RecursiveMode::NonRecursive)?;
        let registered = register_tree(&mut watcher, &self.root, 1) + 1;

        let stop = Arc::new(AtomicBool::new(false));
        let mut pump = EventPump {
            watcher,
            raw_rx,
            translator: EventTranslator::new(self.options.pair_window),
            ignore: self.ignore.clone(),
            tx,
            stop: stop.clone(),
        };
        let handle = thread::Builder::new()
            .name("gbsync-watcher".to_string())
            .spawn(move || pump.run())?;

        *worker = Some(Worker { stop, handle });
        info!(
            root = %self.root.display(),
            directories = registered,
            "File watcher started"
        );
        Ok(())
    }

    /// Stop delivering events and join the watcher thread
    pub fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        worker.stop.store(true, Ordering::Release);
        if worker.handle.join().is_err() {
            error!("File watcher thread panicked");
        }
        info!(root = %self.root.display(), "File watcher stopped");
    }
}

impl Drop for FileSystemWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Watch every directory below `dir` from `min_depth` on. Failures skip the
/// subtree and are logged.
fn register_tree(watcher: &mut RecommendedWatcher, dir: &Path, min_depth: usize) -> usize {
    let mut registered = 0;
    for entry in WalkDir::new(dir).min_depth(min_depth) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Cannot walk directory for watching: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        match watcher.watch(entry.path(), RecursiveMode::NonRecursive) {
            Ok(()) => registered += 1,
            Err(e) => warn!(path = %entry.path().display(), "Cannot watch directory: {}", e),
        }
    }
    registered
}

/// Owns the notify watcher on the watcher thread
struct EventPump {
    watcher: RecommendedWatcher,
    raw_rx: std_mpsc::Receiver<notify::Result<Event>>,
    translator: EventTranslator,
    ignore: IgnoreRegistry,
    tx: mpsc::UnboundedSender<WatchEvent>,
    stop: Arc<AtomicBool>,
}

impl EventPump {
    fn run(&mut self) {
        debug!("Watcher thread running");
        while !self.stop.load(Ordering::Acquire) {
            let translated = match self.raw_rx.recv_timeout(POLL_INTERVAL) {
                Ok(Ok(event)) => self.translator.translate(event, Instant::now()),
                Ok(Err(e)) => {
                    warn!("Filesystem notification error: {}", e);
                    Vec::new()
                }
                Err(RecvTimeoutError::Timeout) => Vec::new(),
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let expired = self.translator.flush_expired(Instant::now());
            for event in translated.into_iter().chain(expired) {
                if !self.dispatch(event) {
                    debug!("Watch event receiver dropped");
                    return;
                }
            }
        }
        debug!("Watcher thread exiting");
    }

    /// Returns false once nobody listens anymore
    fn dispatch(&mut self, event: WatchEvent) -> bool {
        let new_directory = match &event {
            WatchEvent::Created(path) if path.is_dir() => Some((path.clone(), true)),
            WatchEvent::Moved { after, .. } if after.is_dir() => Some((after.clone(), false)),
            _ => None,
        };

        let mut outgoing = vec![event];
        if let Some((dir, report_contents)) = new_directory {
            register_tree(&mut self.watcher, &dir, 0);
            // Entries may have landed before the directory was watched
            if report_contents {
                outgoing.extend(
                    WalkDir::new(&dir)
                        .min_depth(1)
                        .into_iter()
                        .filter_map(|entry| entry.ok())
                        .map(|entry| WatchEvent::Created(entry.into_path())),
                );
            }
        }

        for event in outgoing {
            if self.is_suppressed(&event) {
                trace!(kind = event.kind(), path = %event.path().display(), "Swallowed own change");
                continue;
            }
            if self.tx.send(event).is_err() {
                return false;
            }
        }
        true
    }

    fn is_suppressed(&self, event: &WatchEvent) -> bool {
        match event {
            WatchEvent::Created(path) | WatchEvent::Modified(path) | WatchEvent::Deleted(path) => {
                self.ignore.swallows(path)
            }
            WatchEvent::Moved { before, after } => {
                self.ignore.swallows(before) || self.ignore.swallows(after)
            }
        }
    }
}

#[derive(Debug)]
struct PendingRename {
    from: PathBuf,
    to: Option<PathBuf>,
    since: Instant,
}

/// Turns raw notify events into [`WatchEvent`]s, pairing rename halves
#[derive(Debug)]
pub(crate) struct EventTranslator {
    pending: HashMap<usize, PendingRename>,
    pair_window: Duration,
}

impl EventTranslator {
    pub(crate) fn new(pair_window: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            pair_window,
        }
    }

    pub(crate) fn translate(&mut self, event: Event, now: Instant) -> Vec<WatchEvent> {
        let tracker = event.attrs.tracker();
        match event.kind {
            EventKind::Create(_) => event.paths.into_iter().map(WatchEvent::Created).collect(),
            EventKind::Remove(_) => event.paths.into_iter().map(WatchEvent::Deleted).collect(),
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if let Some(tracker) = tracker {
                    self.pending.remove(&tracker);
                }
                let mut paths = event.paths.into_iter();
                match (paths.next(), paths.next()) {
                    (Some(before), Some(after)) => {
                        self.pending.retain(|_, pending| pending.from != before);
                        vec![WatchEvent::Moved { before, after }]
                    }
                    (Some(path), None) => vec![created_or_deleted(path)],
                    _ => Vec::new(),
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => match tracker {
                Some(tracker) => {
                    for from in event.paths {
                        self.pending.insert(
                            tracker,
                            PendingRename {
                                from,
                                to: None,
                                since: now,
                            },
                        );
                    }
                    Vec::new()
                }
                None => event.paths.into_iter().map(WatchEvent::Deleted).collect(),
            },
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                match tracker.and_then(|tracker| self.pending.get_mut(&tracker)) {
                    // The paired Both notification settles it
                    Some(pending) => {
                        pending.to = event.paths.into_iter().next();
                        Vec::new()
                    }
                    None => event.paths.into_iter().map(WatchEvent::Created).collect(),
                }
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                event.paths.into_iter().map(created_or_deleted).collect()
            }
            EventKind::Modify(_) => event.paths.into_iter().map(WatchEvent::Modified).collect(),
            EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
        }
    }

    /// Settle rename halves older than the pairing window: a lone `From`
    /// left the tree, a `From` with a `To` moved inside it.
    pub(crate) fn flush_expired(&mut self, now: Instant) -> Vec<WatchEvent> {
        let window = self.pair_window;
        let expired: Vec<usize> = self
            .pending
            .iter()
            .filter(|(_, pending)| now.saturating_duration_since(pending.since) >= window)
            .map(|(tracker, _)| *tracker)
            .collect();

        expired
            .into_iter()
            .filter_map(|tracker| self.pending.remove(&tracker))
            .map(|pending| match pending.to {
                Some(after) => WatchEvent::Moved {
                    before: pending.from,
                    after,
                },
                None => WatchEvent::Deleted(pending.from),
            })
            .collect()
    }
}

/// Rename notifications that carry a single path name either side
fn created_or_deleted(path: PathBuf) -> WatchEvent {
    if path.exists() {
        WatchEvent::Created(path)
    } else {
        WatchEvent::Deleted(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use std::fs;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn rename(mode: RenameMode, paths: &[&str], tracker: usize) -> Event {
        paths
            .iter()
            .fold(Event::new(EventKind::Modify(ModifyKind::Name(mode))), |event, path| {
                event.add_path(PathBuf::from(path))
            })
            .set_tracker(tracker)
    }

    #[test]
    fn test_plain_events_translate_one_to_one() {
        let mut translator = EventTranslator::new(DEFAULT_PAIR_WINDOW);
        let now = Instant::now();

        let created = Event::new(EventKind::Create(CreateKind::File)).add_path("/r/a".into());
        let modified = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path("/r/a".into());
        let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path("/r/a".into());
        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any)).add_path("/r/a".into());

        assert_eq!(translator.translate(created, now), vec![WatchEvent::Created("/r/a".into())]);
        assert_eq!(translator.translate(modified, now), vec![WatchEvent::Modified("/r/a".into())]);
        assert_eq!(translator.translate(removed, now), vec![WatchEvent::Deleted("/r/a".into())]);
        assert!(translator.translate(access, now).is_empty());
    }

    #[test]
    fn test_rename_halves_pair_into_one_move() {
        let mut translator = EventTranslator::new(DEFAULT_PAIR_WINDOW);
        let now = Instant::now();

        assert!(translator.translate(rename(RenameMode::From, &["/r/old"], 7), now).is_empty());
        assert!(translator.translate(rename(RenameMode::To, &["/r/new"], 7), now).is_empty());
        let events = translator.translate(rename(RenameMode::Both, &["/r/old", "/r/new"], 7), now);

        assert_eq!(
            events,
            vec![WatchEvent::Moved {
                before: "/r/old".into(),
                after: "/r/new".into()
            }]
        );
        assert!(translator.flush_expired(now + Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn test_lone_from_becomes_delete_after_window() {
        let mut translator = EventTranslator::new(Duration::from_millis(500));
        let now = Instant::now();
        translator.translate(rename(RenameMode::From, &["/r/gone"], 3), now);

        assert!(translator.flush_expired(now + Duration::from_millis(100)).is_empty());
        assert_eq!(
            translator.flush_expired(now + Duration::from_millis(600)),
            vec![WatchEvent::Deleted("/r/gone".into())]
        );
    }

    #[test]
    fn test_from_and_to_without_both_still_move() {
        let mut translator = EventTranslator::new(Duration::from_millis(500));
        let now = Instant::now();
        translator.translate(rename(RenameMode::From, &["/r/a"], 9), now);
        translator.translate(rename(RenameMode::To, &["/r/b"], 9), now);

        assert_eq!(
            translator.flush_expired(now + Duration::from_secs(1)),
            vec![WatchEvent::Moved {
                before: "/r/a".into(),
                after: "/r/b".into()
            }]
        );
    }

    #[test]
    fn test_unknown_to_becomes_create() {
        let mut translator = EventTranslator::new(DEFAULT_PAIR_WINDOW);
        let events = translator.translate(rename(RenameMode::To, &["/r/incoming"], 11), Instant::now());
        assert_eq!(events, vec![WatchEvent::Created("/r/incoming".into())]);
    }

    /// Everything received up to and including the first event for `path`
    async fn events_until(
        rx: &mut mpsc::UnboundedReceiver<WatchEvent>,
        path: &Path,
    ) -> Option<Vec<WatchEvent>> {
        timeout(Duration::from_secs(5), async {
            let mut seen = Vec::new();
            while let Some(event) = rx.recv().await {
                let matched = event.path() == path;
                seen.push(event);
                if matched {
                    return Some(seen);
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }

    #[tokio::test]
    async fn test_watcher_reports_files_in_new_directories() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let watcher = FileSystemWatcher::new(&root, WatcherOptions::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        watcher.start(tx).unwrap();
        assert!(watcher.is_running());

        let nested = root.join("fresh").join("deeper");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("note.txt"), b"hi").unwrap();

        let events = events_until(&mut rx, &nested.join("note.txt")).await;
        assert!(events.is_some(), "file inside a new directory was not reported");

        watcher.stop();
        assert!(!watcher.is_running());
    }

    #[tokio::test]
    async fn test_watcher_swallows_ignored_paths() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let watcher = FileSystemWatcher::new(&root, WatcherOptions::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        watcher.start(tx).unwrap();

        let ignored = root.join("ignored.txt");
        let visible = root.join("visible.txt");
        watcher.start_ignoring(ignored.clone());
        fs::write(&ignored, b"own write").unwrap();
        fs::write(&visible, b"foreign write").unwrap();

        let events = events_until(&mut rx, &visible).await.unwrap();
        assert!(events.iter().all(|event| event.path() != ignored.as_path()));
        watcher.stop();
    }
}
