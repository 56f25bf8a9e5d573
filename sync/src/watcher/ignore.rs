//! Suppression of notifications caused by the engine's own filesystem writes

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::trace;

/// How long a released path keeps swallowing stale notifications
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
enum Suppression {
    /// A writer holds the path; `holders` counts overlapping holds
    Active { holders: usize },
    /// Released; notifications not newer than `stopped_at` are still stale
    Grace {
        stopped_at: SystemTime,
        expires: Instant,
    },
}

#[derive(Debug, Default)]
struct Entries {
    suppressed: HashMap<PathBuf, Suppression>,
    foreseen: HashSet<PathBuf>,
}

/// Shared set of suppressed paths. Cloning shares the same registry.
///
/// Matching is component-wise: suppressing `/a/foo` covers `/a/foo/bar` but
/// not `/a/foo2`.
#[derive(Debug, Clone)]
pub struct IgnoreRegistry {
    entries: Arc<Mutex<Entries>>,
    grace_period: Duration,
}

impl Default for IgnoreRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

impl IgnoreRegistry {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries::default())),
            grace_period,
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Swallow every notification at or below `path` until released
    pub fn start_ignoring(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut entries = self.entries.lock();
        let holders = match entries.suppressed.get(&path) {
            Some(Suppression::Active { holders }) => holders + 1,
            _ => 1,
        };
        trace!(path = %path.display(), holders, "Ignoring path");
        entries
            .suppressed
            .insert(path, Suppression::Active { holders });
    }

    /// Release a hold taken with [`start_ignoring`](Self::start_ignoring).
    /// The last release arms the grace window.
    pub fn stop_ignoring(&self, path: impl AsRef<Path>) {
        self.stop_ignoring_at(path.as_ref(), SystemTime::now(), Instant::now());
    }

    fn stop_ignoring_at(&self, path: &Path, stopped_at: SystemTime, now: Instant) {
        let mut entries = self.entries.lock();
        match entries.suppressed.get_mut(path) {
            Some(Suppression::Active { holders }) if *holders > 1 => {
                *holders -= 1;
            }
            Some(entry) => {
                *entry = Suppression::Grace {
                    stopped_at,
                    expires: now + self.grace_period,
                };
                trace!(path = %path.display(), "Path released into grace window");
            }
            None => {}
        }
    }

    /// Swallow exactly one upcoming notification for exactly `path`
    pub fn foresee(&self, path: impl Into<PathBuf>) {
        self.entries.lock().foreseen.insert(path.into());
    }

    /// Decide whether a notification for `path` must be swallowed, reading
    /// its modification time from disk.
    pub fn swallows(&self, path: &Path) -> bool {
        let metadata = std::fs::symlink_metadata(path).ok();
        let mtime = metadata.as_ref().and_then(|metadata| metadata.modified().ok());
        let is_directory = metadata.is_some_and(|metadata| metadata.is_dir());
        self.decide(path, mtime, is_directory, Instant::now())
    }

    /// Decide whether a notification for `path` with modification time
    /// `mtime` must be swallowed. A missing `mtime` (entry gone from disk)
    /// counts as stale. A foreseen path is consumed only when nothing else
    /// swallowed the notification.
    pub fn should_swallow(&self, path: &Path, mtime: Option<SystemTime>, now: Instant) -> bool {
        self.decide(path, mtime, false, now)
    }

    /// [`should_swallow`](Self::should_swallow) for a directory. Its mtime
    /// moves whenever an entry lands in it, so a released directory stays
    /// swallowed for its whole grace window.
    pub fn should_swallow_directory(
        &self,
        path: &Path,
        mtime: Option<SystemTime>,
        now: Instant,
    ) -> bool {
        self.decide(path, mtime, true, now)
    }

    fn decide(
        &self,
        path: &Path,
        mtime: Option<SystemTime>,
        is_directory: bool,
        now: Instant,
    ) -> bool {
        let mut entries = self.entries.lock();
        entries.suppressed.retain(|_, suppression| match suppression {
            Suppression::Grace { expires, .. } => *expires > now,
            Suppression::Active { .. } => true,
        });

        let suppressed = entries
            .suppressed
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix))
            .any(|(prefix, suppression)| match suppression {
                Suppression::Active { .. } => true,
                Suppression::Grace { .. } if is_directory && path == prefix.as_path() => true,
                Suppression::Grace { stopped_at, .. } => {
                    mtime.map_or(true, |modified| modified <= *stopped_at)
                }
            });
        if suppressed {
            return true;
        }

        entries.foreseen.remove(path)
    }

    pub fn is_empty(&self) -> bool {
        let entries = self.entries.lock();
        entries.suppressed.is_empty() && entries.foreseen.is_empty()
    }
}

/// Releases a path on drop, so error paths also arm the grace window
#[must_use = "the path is released as soon as the guard is dropped"]
pub struct IgnoreGuard {
    registry: IgnoreRegistry,
    path: PathBuf,
}

impl IgnoreGuard {
    pub fn new(registry: &IgnoreRegistry, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        registry.start_ignoring(path.clone());
        Self {
            registry: registry.clone(),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IgnoreGuard {
    fn drop(&mut self) {
        self.registry.stop_ignoring(&self.path);
    }
}
