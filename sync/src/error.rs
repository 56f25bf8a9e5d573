//! Error types for the sync engine library

use std::path::PathBuf;

use gbsync_core::ClientError;

use crate::work::WorkState;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Comprehensive error type for sync operations
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage client errors
    #[error("Storage error: {0}")]
    Client(#[from] ClientError),

    /// Path-related errors
    #[error("Path error at '{path}': {message}")]
    Path { path: PathBuf, message: String },

    /// Filesystem notification errors
    #[error("Watcher error: {0}")]
    Watcher(#[from] notify::Error),

    /// Illegal work lifecycle step
    #[error("Invalid work transition from {from:?} to {to:?}")]
    InvalidTransition { from: WorkState, to: WorkState },

    /// Work that cannot be executed as described
    #[error("Invalid work: {0}")]
    InvalidWork(String),

    /// Reconciliation errors
    #[error("Reconciliation error: {0}")]
    Reconcile(String),

    /// Cancellation error
    #[error("Operation was cancelled")]
    Cancelled,

    /// Generic errors with context
    #[error("Error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl SyncError {
    /// Create a new path error
    pub fn path_error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Path {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new invalid work error
    pub fn invalid_work(message: impl Into<String>) -> Self {
        Self::InvalidWork(message.into())
    }

    /// Short label used in logs and metrics
    pub fn category(&self) -> &'static str {
        match self {
            SyncError::Io(_) | SyncError::Path { .. } => "local_io",
            SyncError::Client(_) => "storage",
            SyncError::Watcher(_) => "watcher",
            SyncError::InvalidTransition { .. } | SyncError::InvalidWork(_) => "work",
            SyncError::Reconcile(_) => "reconcile",
            SyncError::Cancelled => "cancelled",
            SyncError::Generic(_) => "generic",
        }
    }
}
