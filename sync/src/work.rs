//! Units of synchronization work and their lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use gbsync_core::{GbFile, SyncEvent, SyncEventKind};

use crate::error::{Result, SyncError};

/// The action a [`Work`] performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkKind {
    /// Storage → local
    Download,
    /// Local → storage
    Upload,
    /// Rename a local entry after a storage-side move or modification
    MoveInClient,
    /// Rename an entry on the storage after a local move
    MoveInStorage,
    /// Delete a local entry
    RemoveInClient,
    /// Delete an entry on the storage
    RemoveInStorage,
}

impl WorkKind {
    pub const ALL: [WorkKind; 6] = [
        WorkKind::Download,
        WorkKind::Upload,
        WorkKind::MoveInClient,
        WorkKind::MoveInStorage,
        WorkKind::RemoveInClient,
        WorkKind::RemoveInStorage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkKind::Download => "download",
            WorkKind::Upload => "upload",
            WorkKind::MoveInClient => "move_in_client",
            WorkKind::MoveInStorage => "move_in_storage",
            WorkKind::RemoveInClient => "remove_in_client",
            WorkKind::RemoveInStorage => "remove_in_storage",
        }
    }

    /// Whether executing this kind mutates the local filesystem
    pub fn mutates_local(self) -> bool {
        matches!(
            self,
            WorkKind::Download | WorkKind::MoveInClient | WorkKind::RemoveInClient
        )
    }
}

impl fmt::Display for WorkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle: `Queued → Running → {End | Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkState {
    Queued,
    Running,
    End,
    Failed,
}

impl WorkState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkState::End | WorkState::Failed)
    }

    pub fn can_transition_to(self, next: WorkState) -> bool {
        matches!(
            (self, next),
            (WorkState::Queued, WorkState::Running)
                | (WorkState::Running, WorkState::End)
                | (WorkState::Running, WorkState::Failed)
        )
    }
}

/// Where a work item came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOrigin {
    Reconcile,
    Watcher,
    Remote,
    /// Produced while expanding a directory transfer
    Derived,
}

/// What happens to a storage event's `before` when it becomes work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeforePolicy {
    Preserve,
    Drop,
}

/// One row of the storage event → work table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMapping {
    pub work: WorkKind,
    pub before: BeforePolicy,
}

impl EventMapping {
    const fn new(work: WorkKind, before: BeforePolicy) -> Self {
        Self { work, before }
    }

    /// The fixed mapping from storage events to work. Exhaustive on purpose:
    /// a new event kind must be given a row here.
    pub const fn for_kind(kind: SyncEventKind) -> Self {
        use BeforePolicy::{Drop, Preserve};
        match kind {
            SyncEventKind::FileCreated => Self::new(WorkKind::Download, Drop),
            SyncEventKind::FileMoved => Self::new(WorkKind::Download, Preserve),
            SyncEventKind::FileModified => Self::new(WorkKind::MoveInClient, Preserve),
            SyncEventKind::FileDeleted => Self::new(WorkKind::RemoveInClient, Drop),
            SyncEventKind::FileCopied => Self::new(WorkKind::Download, Preserve),
            SyncEventKind::FileShared => Self::new(WorkKind::Download, Drop),
            SyncEventKind::FileUnshared => Self::new(WorkKind::RemoveInClient, Drop),
            SyncEventKind::FileTrashed => Self::new(WorkKind::RemoveInClient, Drop),
            SyncEventKind::FileRecovered => Self::new(WorkKind::Download, Drop),
            SyncEventKind::OpenFile => Self::new(WorkKind::Download, Drop),
        }
    }
}

/// A single synchronization action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Work {
    pub id: Uuid,
    pub kind: WorkKind,
    pub file: GbFile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<GbFile>,
    pub origin: WorkOrigin,
    state: WorkState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Work {
    pub fn new(kind: WorkKind, file: GbFile) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            file,
            before: None,
            origin: WorkOrigin::Watcher,
            state: WorkState::Queued,
            created_at: Utc::now(),
            error: None,
        }
    }

    /// Work that relocates `before` to `file`
    pub fn moved(kind: WorkKind, before: GbFile, file: GbFile) -> Self {
        let mut work = Self::new(kind, file);
        work.before = Some(before);
        work
    }

    /// Derive the work for a storage event through [`EventMapping::for_kind`]
    pub fn from_event(event: &SyncEvent) -> Self {
        let mapping = EventMapping::for_kind(event.kind);
        let mut work = Self::new(mapping.work, event.relative_file.clone());
        if mapping.before == BeforePolicy::Preserve {
            work.before = event.before.clone();
        }
        work.origin = WorkOrigin::Remote;
        work
    }

    pub fn with_origin(mut self, origin: WorkOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn state(&self) -> WorkState {
        self.state
    }

    /// Advance the lifecycle, refusing any step outside
    /// `Queued → Running → {End | Failed}`.
    pub fn transition(&mut self, next: WorkState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(SyncError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Move a running work to `Failed`, keeping the reason
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(WorkState::Failed)?;
        self.error = Some(reason.into());
        Ok(())
    }
}

impl fmt::Display for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.before {
            Some(before) => write!(f, "{} {} -> {}", self.kind, before, self.file),
            None => write!(f, "{} {}", self.kind, self.file),
        }
    }
}
