//! Change notifications exchanged with the storage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::file::GbFile;

/// What happened to a file on the storage side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncEventKind {
    FileCreated,
    FileModified,
    FileDeleted,
    FileMoved,
    FileCopied,
    FileShared,
    FileUnshared,
    FileTrashed,
    FileRecovered,
    OpenFile,
}

impl SyncEventKind {
    pub const ALL: [SyncEventKind; 10] = [
        SyncEventKind::FileCreated,
        SyncEventKind::FileModified,
        SyncEventKind::FileDeleted,
        SyncEventKind::FileMoved,
        SyncEventKind::FileCopied,
        SyncEventKind::FileShared,
        SyncEventKind::FileUnshared,
        SyncEventKind::FileTrashed,
        SyncEventKind::FileRecovered,
        SyncEventKind::OpenFile,
    ];

    /// Whether events of this kind describe a prior identity in `before`
    pub fn carries_before(self) -> bool {
        matches!(
            self,
            SyncEventKind::FileMoved | SyncEventKind::FileCopied | SyncEventKind::FileModified
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncEventKind::FileCreated => "file_created",
            SyncEventKind::FileModified => "file_modified",
            SyncEventKind::FileDeleted => "file_deleted",
            SyncEventKind::FileMoved => "file_moved",
            SyncEventKind::FileCopied => "file_copied",
            SyncEventKind::FileShared => "file_shared",
            SyncEventKind::FileUnshared => "file_unshared",
            SyncEventKind::FileTrashed => "file_trashed",
            SyncEventKind::FileRecovered => "file_recovered",
            SyncEventKind::OpenFile => "open_file",
        }
    }
}

impl fmt::Display for SyncEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A storage-side change. `relative_file` is the file as known after the
/// change; `before` is only set for kinds where [`SyncEventKind::carries_before`]
/// holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    /// Monotonic id assigned by the storage, 0 until assigned
    #[serde(default)]
    pub id: u64,
    pub kind: SyncEventKind,
    pub relative_file: GbFile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<GbFile>,
    /// Client that caused the change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl SyncEvent {
    pub fn new(kind: SyncEventKind, relative_file: GbFile, before: Option<GbFile>) -> Self {
        let before = if kind.carries_before() { before } else { None };
        Self {
            id: 0,
            kind,
            relative_file,
            before,
            origin: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }
}
