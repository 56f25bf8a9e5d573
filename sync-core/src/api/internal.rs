//! Same-process storage node
//!
//! [`InternalStorage`] keeps files in a directory on disk and records every
//! mutation as a [`SyncEvent`]. Each [`InternalClient`] is one account
//! device talking to that storage; events are fanned out to every client
//! except the one that caused them.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::error::{ClientError, Result};
use super::{Client, EventStream, UploadSource, EVENT_CHANNEL_CAPACITY};
use crate::event::{SyncEvent, SyncEventKind};
use crate::file::{set_local_mtime, FileId, FileMetadata, GbFile};

/// Suffix of partially written uploads, hidden from listings
const PART_SUFFIX: &str = ".gbsync-part";

/// Staging file next to `target`, unique per upload
fn part_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(format!(".{}{}", uuid::Uuid::new_v4().simple(), PART_SUFFIX));
    PathBuf::from(name)
}

/// Number of events kept for replay after a reconnect
const EVENT_LOG_CAPACITY: usize = 10_000;

struct IdTable {
    by_path: HashMap<Vec<String>, FileId>,
    by_id: HashMap<FileId, Vec<String>>,
    next: i64,
}

impl IdTable {
    fn new() -> Self {
        let mut table = Self {
            by_path: HashMap::new(),
            by_id: HashMap::new(),
            next: 1,
        };
        table.by_path.insert(Vec::new(), FileId::ROOT);
        table.by_id.insert(FileId::ROOT, Vec::new());
        table
    }

    fn id_for(&mut self, segments: &[String]) -> FileId {
        if let Some(id) = self.by_path.get(segments) {
            return *id;
        }
        let id = FileId(self.next);
        self.next += 1;
        self.by_path.insert(segments.to_vec(), id);
        self.by_id.insert(id, segments.to_vec());
        id
    }

    /// Re-key every id under `from` so it lives under `to`
    fn rename(&mut self, from: &[String], to: &[String]) {
        let moved: Vec<(Vec<String>, FileId)> = self
            .by_path
            .iter()
            .filter(|(path, _)| path.starts_with(from))
            .map(|(path, id)| (path.clone(), *id))
            .collect();
        for (path, id) in moved {
            self.by_path.remove(&path);
            let mut renamed = to.to_vec();
            renamed.extend_from_slice(&path[from.len()..]);
            self.by_path.insert(renamed.clone(), id);
            self.by_id.insert(id, renamed);
        }
    }
}

pub struct InternalStorage {
    root: PathBuf,
    ids: Mutex<IdTable>,
    next_event_id: AtomicU64,
    log: Mutex<VecDeque<SyncEvent>>,
    events: broadcast::Sender<SyncEvent>,
}

impl InternalStorage {
    /// Open (creating if needed) a storage rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Arc::new(Self {
            root,
            ids: Mutex::new(IdTable::new()),
            next_event_id: AtomicU64::new(0),
            log: Mutex::new(VecDeque::new()),
            events,
        }))
    }

    /// A client for one device of the account
    pub fn client(self: &Arc<Self>, client_id: impl Into<String>) -> InternalClient {
        InternalClient::new(self.clone(), client_id)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Id of the newest recorded event, 0 when nothing happened yet
    pub fn last_event_id(&self) -> u64 {
        self.next_event_id.load(Ordering::SeqCst)
    }

    /// Events with an id greater than `after`, oldest first
    pub fn events_after(&self, after: u64) -> Vec<SyncEvent> {
        self.log
            .lock()
            .iter()
            .filter(|event| event.id > after)
            .cloned()
            .collect()
    }

    /// Record a change and fan it out. The log lock is held while
    /// broadcasting so replay and live delivery agree on order.
    fn record(
        &self,
        origin: &str,
        kind: SyncEventKind,
        file: GbFile,
        before: Option<GbFile>,
    ) -> SyncEvent {
        let mut log = self.log.lock();
        let id = self.next_event_id.fetch_add(1, Ordering::SeqCst) + 1;
        let event = SyncEvent::new(kind, file, before)
            .with_origin(origin)
            .with_id(id);
        log.push_back(event.clone());
        if log.len() > EVENT_LOG_CAPACITY {
            log.pop_front();
        }
        let _ = self.events.send(event.clone());
        debug!(event_id = id, kind = %kind, path = %event.relative_file, "Storage event recorded");
        event
    }

    fn local_path(&self, segments: &[String]) -> PathBuf {
        segments.iter().fold(self.root.clone(), |path, name| path.join(name))
    }

    fn resolve(&self, file: &GbFile) -> Result<Vec<String>> {
        if let Some(segments) = file.path_segments() {
            for name in segments {
                if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
                    return Err(ClientError::InvalidPath(file.display_path()));
                }
            }
            return Ok(segments.to_vec());
        }

        let ids = self.ids.lock();
        if let Some(path) = ids.by_id.get(&file.id) {
            return Ok(path.clone());
        }
        if let Some(parent) = ids.by_id.get(&file.father_id) {
            let mut path = parent.clone();
            path.push(file.name.clone());
            return Ok(path);
        }
        Err(ClientError::InvalidPath(file.display_path()))
    }

    async fn describe(&self, segments: &[String]) -> Result<Option<GbFile>> {
        let path = self.local_path(segments);
        let metadata = match fs::symlink_metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut file = GbFile::from_segments(segments.to_vec(), metadata.is_dir());
        file.apply_local_metadata(&metadata);
        {
            let mut ids = self.ids.lock();
            file.id = ids.id_for(segments);
            file.father_id = match segments.split_last() {
                Some((_, parent)) => ids.id_for(parent),
                None => FileId::UNKNOWN,
            };
        }
        Ok(Some(file))
    }

    async fn list_children(&self, segments: &[String]) -> Result<Vec<GbFile>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(self.local_path(segments)).await?;
        while let Some(entry) = entries.next_entry().await? {
            match entry.file_name().into_string() {
                Ok(name) if !name.ends_with(PART_SUFFIX) => names.push(name),
                Ok(_) => {}
                Err(name) => warn!("Skipping non UTF-8 storage entry {:?}", name),
            }
        }
        names.sort();

        let mut children = Vec::with_capacity(names.len());
        for name in names {
            let mut child = segments.to_vec();
            child.push(name);
            if let Some(file) = self.describe(&child).await? {
                children.push(file);
            }
        }
        Ok(children)
    }

    async fn require(&self, segments: &[String]) -> Result<GbFile> {
        self.describe(segments)
            .await?
            .ok_or_else(|| ClientError::NotFound(format!("/{}", segments.join("/"))))
    }
}

/// One device's handle on an [`InternalStorage`]
#[derive(Clone)]
pub struct InternalClient {
    storage: Arc<InternalStorage>,
    client_id: String,
}

impl InternalClient {
    pub fn new(storage: Arc<InternalStorage>, client_id: impl Into<String>) -> Self {
        Self {
            storage,
            client_id: client_id.into(),
        }
    }

    pub fn storage(&self) -> &Arc<InternalStorage> {
        &self.storage
    }
}

#[async_trait]
impl Client for InternalClient {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn get_info(&self, file: &GbFile) -> Result<Option<FileMetadata>> {
        let segments = self.storage.resolve(file)?;
        let Some(found) = self.storage.describe(&segments).await? else {
            return Ok(None);
        };
        let children = if found.is_directory {
            self.storage.list_children(&segments).await?
        } else {
            Vec::new()
        };
        Ok(Some(FileMetadata {
            file: found,
            children,
        }))
    }

    async fn get_file(
        &self,
        file: &GbFile,
        destination: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        let segments = self.storage.resolve(file)?;
        let found = self.storage.require(&segments).await?;
        if found.is_directory {
            return Err(ClientError::InvalidPath(format!(
                "{} is a directory",
                found.display_path()
            )));
        }

        let mut source = fs::File::open(self.storage.local_path(&segments)).await?;
        let copied = tokio::io::copy(&mut source, &mut *destination).await?;
        destination.flush().await?;
        Ok(copied)
    }

    async fn upload_file(&self, file: &GbFile, source: &dyn UploadSource) -> Result<FileMetadata> {
        let segments = self.storage.resolve(file)?;
        if segments.is_empty() {
            return Err(ClientError::InvalidPath("cannot upload over the root".to_string()));
        }

        let target = self.storage.local_path(&segments);
        let existed = fs::try_exists(&target).await.unwrap_or(false);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let part = part_path(&target);

        let written = async {
            let mut reader = source.open().await?;
            let mut out = fs::File::create(&part).await?;
            tokio::io::copy(&mut reader, &mut out).await?;
            out.flush().await?;
            drop(out);
            fs::rename(&part, &target).await?;
            set_local_mtime(&target, file.last_update_time)
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&part).await;
            return Err(e.into());
        }

        let stored = self.storage.require(&segments).await?;
        let kind = if existed {
            SyncEventKind::FileModified
        } else {
            SyncEventKind::FileCreated
        };
        self.storage.record(&self.client_id, kind, stored.clone(), None);
        Ok(FileMetadata::new(stored))
    }

    async fn create_directory(&self, file: &GbFile) -> Result<FileMetadata> {
        let segments = self.storage.resolve(file)?;
        let path = self.storage.local_path(&segments);
        if let Some(existing) = self.storage.describe(&segments).await? {
            if !existing.is_directory {
                return Err(ClientError::AlreadyExists(existing.display_path()));
            }
            return Ok(FileMetadata::new(existing));
        }

        fs::create_dir_all(&path).await?;
        let created = self.storage.require(&segments).await?;
        self.storage
            .record(&self.client_id, SyncEventKind::FileCreated, created.clone(), None);
        Ok(FileMetadata::new(created))
    }

    async fn remove_file(&self, file: &GbFile) -> Result<()> {
        let segments = self.storage.resolve(file)?;
        if segments.is_empty() {
            return Err(ClientError::InvalidPath("cannot remove the root".to_string()));
        }
        let Some(existing) = self.storage.describe(&segments).await? else {
            debug!(path = %file, "Remove of unknown storage file ignored");
            return Ok(());
        };

        let path = self.storage.local_path(&segments);
        if existing.is_directory {
            fs::remove_dir_all(&path).await?;
        } else {
            fs::remove_file(&path).await?;
        }
        self.storage
            .record(&self.client_id, SyncEventKind::FileDeleted, existing, None);
        Ok(())
    }

    async fn move_file(
        &self,
        source: &GbFile,
        destination: &GbFile,
        copy: bool,
    ) -> Result<FileMetadata> {
        let from = self.storage.resolve(source)?;
        let to = self.storage.resolve(destination)?;
        if from.is_empty() || to.is_empty() || to.starts_with(&from) {
            return Err(ClientError::InvalidPath(format!(
                "cannot move {} to {}",
                source.display_path(),
                destination.display_path()
            )));
        }

        let before = self.storage.require(&from).await?;
        let from_path = self.storage.local_path(&from);
        let to_path = self.storage.local_path(&to);
        if let Some(existing) = self.storage.describe(&to).await? {
            if existing.is_directory {
                return Err(ClientError::AlreadyExists(existing.display_path()));
            }
        }
        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let kind = if copy {
            copy_tree(from_path, to_path).await?;
            SyncEventKind::FileCopied
        } else {
            fs::rename(&from_path, &to_path).await?;
            self.storage.ids.lock().rename(&from, &to);
            SyncEventKind::FileMoved
        };

        let after = self.storage.require(&to).await?;
        self.storage
            .record(&self.client_id, kind, after.clone(), Some(before));
        Ok(FileMetadata::new(after))
    }

    async fn subscribe(&self, after: Option<u64>) -> Result<EventStream> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        // Subscribe while holding the log lock so nothing falls between the
        // replayed backlog and the live feed.
        let (backlog, mut live) = {
            let log = self.storage.log.lock();
            let live = self.storage.events.subscribe();
            let backlog: Vec<SyncEvent> = match after {
                Some(after) => log.iter().filter(|e| e.id > after).cloned().collect(),
                None => Vec::new(),
            };
            (backlog, live)
        };

        let client_id = self.client_id.clone();
        tokio::spawn(async move {
            let foreign = |event: &SyncEvent| event.origin.as_deref() != Some(client_id.as_str());

            for event in backlog.into_iter().filter(|e| foreign(e)) {
                if tx.send(event).await.is_err() {
                    return;
                }
            }

            loop {
                tokio::select! {
                    received = live.recv() => match received {
                        Ok(event) => {
                            if foreign(&event) && tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Storage event subscriber lagged, {} events were dropped", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    _ = tx.closed() => return,
                }
            }
        });

        Ok(rx)
    }
}

async fn copy_tree(from: PathBuf, to: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let mut pending = vec![(from, to)];
        while let Some((source, target)) = pending.pop() {
            if source.is_dir() {
                std::fs::create_dir_all(&target)?;
                for entry in std::fs::read_dir(&source)? {
                    let entry = entry?;
                    pending.push((entry.path(), target.join(entry.file_name())));
                }
            } else {
                std::fs::copy(&source, &target)?;
            }
        }
        Ok(())
    })
    .await
    .map_err(|e| ClientError::Unknown(format!("copy task failed: {}", e)))??;
    Ok(())
}
