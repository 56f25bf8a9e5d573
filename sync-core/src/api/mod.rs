//! Storage client capability
//!
//! The sync engine talks to the storage only through [`Client`]. Two
//! variants exist:
//! - [`InternalClient`]: a storage node living in the same process, backed by
//!   a directory on disk
//! - [`HttpClient`]: a remote storage node reached over HTTP, with change
//!   events pushed over a WebSocket

pub mod error;
pub mod http;
pub mod internal;
pub mod realtime;

use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::event::SyncEvent;
use crate::file::{FileMetadata, GbFile};

pub use error::{ClientError, Result};
pub use http::{HttpClient, HttpClientBuilder};
pub use internal::{InternalClient, InternalStorage};
pub use realtime::EventSubscriber;

/// Events pushed by the storage, in id order
pub type EventStream = mpsc::Receiver<SyncEvent>;

/// Capacity of the channel handed out by [`Client::subscribe`]
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Reader handed out by [`UploadSource::open`]
pub type UploadReader = Box<dyn AsyncRead + Unpin + Send + Sync>;

/// Content of an upload. Every `open` starts again from the first byte, so
/// a failed transfer can be sent again without buffering the content.
#[async_trait]
pub trait UploadSource: Send + Sync {
    async fn open(&self) -> io::Result<UploadReader>;
}

/// Upload content read from a local file
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl UploadSource for FileSource {
    async fn open(&self) -> io::Result<UploadReader> {
        Ok(Box::new(tokio::fs::File::open(&self.path).await?))
    }
}

#[async_trait]
impl UploadSource for Vec<u8> {
    async fn open(&self) -> io::Result<UploadReader> {
        Ok(Box::new(io::Cursor::new(self.clone())))
    }
}

#[async_trait]
impl UploadSource for &'static [u8] {
    async fn open(&self) -> io::Result<UploadReader> {
        Ok(Box::new(*self))
    }
}

#[async_trait]
pub trait Client: Send + Sync {
    /// Identity this client uses as the origin of its changes
    fn client_id(&self) -> &str;

    /// Remote lookup. `Ok(None)` means the storage has no record of the file.
    async fn get_info(&self, file: &GbFile) -> Result<Option<FileMetadata>>;

    /// Stream the file content into `destination`, returning the byte count
    async fn get_file(
        &self,
        file: &GbFile,
        destination: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64>;

    /// Store the content of `source` as `file`. The storage keeps
    /// `file.last_update_time` as the file's modification time.
    async fn upload_file(&self, file: &GbFile, source: &dyn UploadSource) -> Result<FileMetadata>;

    async fn create_directory(&self, file: &GbFile) -> Result<FileMetadata>;

    async fn remove_file(&self, file: &GbFile) -> Result<()>;

    async fn move_file(&self, source: &GbFile, destination: &GbFile, copy: bool)
        -> Result<FileMetadata>;

    /// Events caused by other clients, starting after event id `after`
    async fn subscribe(&self, after: Option<u64>) -> Result<EventStream>;
}
