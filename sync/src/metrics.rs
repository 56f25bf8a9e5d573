//! Metrics and statistics for the sync engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use uuid::Uuid;

use gbsync_core::SyncEventKind;

use crate::watcher::WatchEvent;
use crate::work::WorkKind;

/// How a work item left the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl WorkOutcome {
    pub const ALL: [WorkOutcome; 3] = [
        WorkOutcome::Completed,
        WorkOutcome::Failed,
        WorkOutcome::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkOutcome::Completed => "completed",
            WorkOutcome::Failed => "failed",
            WorkOutcome::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const WATCH_KINDS: [&str; 4] = ["created", "modified", "deleted", "moved"];

fn watch_kind_index(event: &WatchEvent) -> usize {
    match event {
        WatchEvent::Created(_) => 0,
        WatchEvent::Modified(_) => 1,
        WatchEvent::Deleted(_) => 2,
        WatchEvent::Moved { .. } => 3,
    }
}

/// Live engine counters, shared by the manager, the dispatcher and the host.
/// Every counter is an atomic; readers take a [`MetricsSnapshot`].
#[derive(Debug)]
pub struct SyncMetrics {
    /// Identifies one engine instance in logs and status output
    session_id: Uuid,
    started_at: DateTime<Utc>,
    submitted: AtomicU64,
    in_flight: AtomicI64,
    /// Indexed by work kind, then outcome
    works: [[AtomicU64; 3]; 6],
    remote_events: [AtomicU64; 10],
    watcher_events: [AtomicU64; 4],
    reconcile_passes: AtomicU64,
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            submitted: AtomicU64::new(0),
            in_flight: AtomicI64::new(0),
            works: Default::default(),
            remote_events: Default::default(),
            watcher_events: Default::default(),
            reconcile_passes: AtomicU64::new(0),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a finished work. `was_running` is false for work cancelled
    /// before it acquired a permit.
    pub fn record_finished(&self, kind: WorkKind, outcome: WorkOutcome, was_running: bool) {
        if was_running {
            self.in_flight.fetch_sub(1, Ordering::Relaxed);
        }
        self.works[kind as usize][outcome as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_event(&self, kind: SyncEventKind) {
        self.remote_events[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_watch_event(&self, event: &WatchEvent) {
        self.watcher_events[watch_kind_index(event)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconcile_pass(&self) {
        self.reconcile_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn works(&self, kind: WorkKind, outcome: WorkOutcome) -> u64 {
        self.works[kind as usize][outcome as usize].load(Ordering::Relaxed)
    }

    /// Total over all kinds
    pub fn total(&self, outcome: WorkOutcome) -> u64 {
        WorkKind::ALL
            .iter()
            .map(|kind| self.works(*kind, outcome))
            .sum()
    }

    /// Share of finished works that completed, 1.0 when nothing finished yet
    pub fn success_rate(&self) -> f64 {
        let completed = self.total(WorkOutcome::Completed);
        let failed = self.total(WorkOutcome::Failed);
        if completed + failed == 0 {
            return 1.0;
        }
        completed as f64 / (completed + failed) as f64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let works = WorkKind::ALL
            .iter()
            .flat_map(|kind| {
                WorkOutcome::ALL.iter().map(move |outcome| WorkCount {
                    kind: *kind,
                    outcome: *outcome,
                    count: self.works(*kind, *outcome),
                })
            })
            .collect();

        MetricsSnapshot {
            session_id: self.session_id,
            started_at: self.started_at,
            submitted: self.submitted.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
            works,
            remote_events: SyncEventKind::ALL
                .iter()
                .map(|kind| (*kind, self.remote_events[*kind as usize].load(Ordering::Relaxed)))
                .collect(),
            watcher_events: WATCH_KINDS
                .iter()
                .enumerate()
                .map(|(index, kind)| {
                    (kind.to_string(), self.watcher_events[index].load(Ordering::Relaxed))
                })
                .collect(),
            reconcile_passes: self.reconcile_passes.load(Ordering::Relaxed),
        }
    }

    /// Generate a one-line summary for logs
    pub fn summary(&self) -> String {
        format!(
            "submitted: {}, completed: {}, failed: {}, cancelled: {}, in flight: {}, success rate: {:.1}%",
            self.submitted.load(Ordering::Relaxed),
            self.total(WorkOutcome::Completed),
            self.total(WorkOutcome::Failed),
            self.total(WorkOutcome::Cancelled),
            self.in_flight(),
            self.success_rate() * 100.0
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkCount {
    pub kind: WorkKind,
    pub outcome: WorkOutcome,
    pub count: u64,
}

/// Point-in-time copy of [`SyncMetrics`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub submitted: u64,
    pub in_flight: i64,
    pub works: Vec<WorkCount>,
    pub remote_events: Vec<(SyncEventKind, u64)>,
    pub watcher_events: Vec<(String, u64)>,
    pub reconcile_passes: u64,
}

impl MetricsSnapshot {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
