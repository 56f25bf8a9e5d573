//! Sync Engine Library
//!
//! Keeps a local directory converged with a storage node:
//! - An initial reconciliation walk over both trees
//! - A filesystem watcher that ignores the engine's own writes
//! - Storage change events turned into work through a fixed mapping
//! - Bounded-concurrency execution of the resulting work

pub mod employee;
pub mod error;
pub mod metrics;
pub mod reconcile;
pub mod sync_engine;
pub mod watcher;
pub mod work;
pub mod work_manager;

// Re-export main types
pub use employee::Employee;
pub use error::{Result, SyncError};
pub use metrics::{MetricsSnapshot, SyncMetrics, WorkOutcome};
pub use reconcile::{DiskTree, LocalTree, ReconcileOutcome, ReconcileReport, Reconciler};
pub use sync_engine::{SyncEngine, SyncInput, SyncOptions, SyncStatus};
pub use watcher::{FileSystemWatcher, IgnoreRegistry, WatchEvent, WatcherOptions};
pub use work::{EventMapping, Work, WorkKind, WorkOrigin, WorkState};
pub use work_manager::{WorkExecutor, WorkManager, WorkManagerOptions, WorkStats};
