//! Execution of single work items against the storage and the local tree

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use gbsync_core::file::{from_system_time, set_local_mtime};
use gbsync_core::{Client, FileMetadata, FileSource, GbFile};

use crate::error::{Result, SyncError};
use crate::watcher::{IgnoreGuard, IgnoreRegistry};
use crate::work::{Work, WorkKind};
use crate::work_manager::WorkExecutor;

/// Suffix of partially downloaded files
pub const PART_SUFFIX: &str = ".gbsync-part";

/// Whether a local entry is a transfer leftover rather than user data
pub fn is_partial(name: &str) -> bool {
    name.ends_with(PART_SUFFIX)
}

/// Staging file for one work's download of `local`
fn part_path(local: &Path, work_id: Uuid) -> PathBuf {
    let mut name = local.as_os_str().to_owned();
    name.push(format!(".{}{}", work_id.simple(), PART_SUFFIX));
    PathBuf::from(name)
}

/// Turns one [`Work`] into concrete I/O. Every local mutation happens under
/// an [`IgnoreGuard`] so the watcher does not echo it back.
pub struct Employee {
    client: Arc<dyn Client>,
    root: PathBuf,
    ignore: IgnoreRegistry,
}

impl Employee {
    pub fn new(client: Arc<dyn Client>, root: impl Into<PathBuf>, ignore: IgnoreRegistry) -> Self {
        Self {
            client,
            root: root.into(),
            ignore,
        }
    }

    fn local_path(&self, file: &GbFile) -> Result<PathBuf> {
        file.to_local_path(&self.root)
            .ok_or_else(|| SyncError::invalid_work(format!("{} has no resolved path", file)))
    }

    fn guard(&self, path: &Path) -> IgnoreGuard {
        IgnoreGuard::new(&self.ignore, path)
    }

    async fn download(&self, work: &Work) -> Result<Vec<Work>> {
        let file = &work.file;
        let Some(remote) = self.client.get_info(file).await? else {
            debug!(path = %file, "Storage no longer has the file, nothing to download");
            return Ok(Vec::new());
        };
        let local = self.local_path(file)?;

        if !remote.is_directory() {
            self.download_file(work, &remote, &local).await?;
            return Ok(Vec::new());
        }

        match fs::symlink_metadata(&local).await {
            Ok(metadata) if !metadata.is_dir() => {
                return Err(SyncError::path_error(
                    &local,
                    "a local file is in the way of a storage directory",
                ));
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let _guard = self.guard(&local);
                fs::create_dir_all(&local).await?;
            }
            Err(e) => return Err(e.into()),
        }

        Ok(remote
            .children
            .iter()
            .map(|child| {
                let target = file.child(child.name.clone(), child.is_directory);
                Work::new(WorkKind::Download, target.with_metadata(child))
            })
            .collect())
    }

    /// Stream the storage content into `local` through a part file, then
    /// align the local mtime with the storage's.
    async fn download_file(&self, work: &Work, remote: &FileMetadata, local: &Path) -> Result<()> {
        let file = &work.file;
        let part = part_path(local, work.id);

        let _guard = self.guard(local);
        let _part_guard = self.guard(&part);

        if let Some(parent) = local.parent() {
            if !parent.exists() {
                let _parent_guard = self.guard(parent);
                fs::create_dir_all(parent).await?;
            }
        }

        let transferred = async {
            let mut out = fs::File::create(&part).await?;
            let bytes = self.client.get_file(file, &mut out).await?;
            out.flush().await?;
            drop(out);
            fs::rename(&part, local).await?;
            set_local_mtime(local, remote.file.last_update_time)?;
            Ok::<u64, SyncError>(bytes)
        }
        .await;

        match transferred {
            Ok(bytes) => {
                debug!(path = %file, bytes, "Downloaded");
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&part).await;
                Err(e)
            }
        }
    }

    async fn upload(&self, file: &GbFile) -> Result<Vec<Work>> {
        let local = self.local_path(file)?;
        let metadata = match fs::symlink_metadata(&local).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %file, "Local file vanished before upload");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut described = file.clone();
        described.apply_local_metadata(&metadata);

        if !metadata.is_dir() {
            self.client
                .upload_file(&described, &FileSource::new(&local))
                .await?;
            debug!(path = %file, bytes = described.size, "Uploaded");
            return Ok(Vec::new());
        }

        self.client.create_directory(&described).await?;

        let mut derived = Vec::new();
        let mut entries = fs::read_dir(&local).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = match entry.file_name().into_string() {
                Ok(name) if is_partial(&name) => continue,
                Ok(name) => name,
                Err(name) => {
                    warn!("Skipping non UTF-8 local entry {:?}", name);
                    continue;
                }
            };
            let is_directory = entry.file_type().await?.is_dir();
            derived.push(Work::new(WorkKind::Upload, described.child(name, is_directory)));
        }
        Ok(derived)
    }

    /// Apply a storage-side move or modification: relocate the local entry,
    /// then pull newer content.
    async fn move_in_client(&self, work: &Work) -> Result<Vec<Work>> {
        let target = self.local_path(&work.file)?;

        if let Some(before) = &work.before {
            let source = self.local_path(before)?;
            if source != target && fs::try_exists(&source).await.unwrap_or(false) {
                let _source_guard = self.guard(&source);
                let _target_guard = self.guard(&target);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::rename(&source, &target).await?;
                debug!(from = %before, to = %work.file, "Moved locally");
            }
        }

        let Some(remote) = self.client.get_info(&work.file).await? else {
            return Ok(Vec::new());
        };

        let local_time = fs::metadata(&target)
            .await
            .ok()
            .and_then(|metadata| metadata.modified().ok())
            .map(from_system_time);

        if remote.is_directory() {
            return Ok(match local_time {
                Some(_) => Vec::new(),
                None => vec![Work::new(WorkKind::Download, work.file.clone())],
            });
        }

        if local_time.map_or(true, |local| remote.file.last_update_time > local) {
            self.download_file(work, &remote, &target).await?;
        }
        Ok(Vec::new())
    }

    async fn move_in_storage(&self, work: &Work) -> Result<Vec<Work>> {
        let before = work
            .before
            .as_ref()
            .ok_or_else(|| SyncError::invalid_work("storage move without a source"))?;
        self.client.move_file(before, &work.file, false).await?;
        Ok(Vec::new())
    }

    async fn remove_in_client(&self, file: &GbFile) -> Result<Vec<Work>> {
        if file.is_root() {
            return Err(SyncError::invalid_work("refusing to remove the sync root"));
        }
        let local = self.local_path(file)?;
        let _guard = self.guard(&local);

        let removed = match fs::symlink_metadata(&local).await {
            Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(&local).await,
            Ok(_) => fs::remove_file(&local).await,
            Err(e) => Err(e),
        };
        match removed {
            Ok(()) => debug!(path = %file, "Removed locally"),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %file, "Local file already gone")
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Vec::new())
    }

    async fn remove_in_storage(&self, file: &GbFile) -> Result<Vec<Work>> {
        if file.is_root() {
            return Err(SyncError::invalid_work("refusing to remove the storage root"));
        }
        self.client.remove_file(file).await?;
        Ok(Vec::new())
    }
}

#[async_trait]
impl WorkExecutor for Employee {
    #[instrument(skip_all, fields(work_id = %work.id, kind = %work.kind, path = %work.file))]
    async fn execute(&self, work: &Work) -> Result<Vec<Work>> {
        match work.kind {
            WorkKind::Download => self.download(work).await,
            WorkKind::Upload => self.upload(&work.file).await,
            WorkKind::MoveInClient => self.move_in_client(work).await,
            WorkKind::MoveInStorage => self.move_in_storage(work).await,
            WorkKind::RemoveInClient => self.remove_in_client(&work.file).await,
            WorkKind::RemoveInStorage => self.remove_in_storage(&work.file).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gbsync_core::InternalStorage;
    use std::time::{Duration, Instant, SystemTime};
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        local: PathBuf,
        storage: Arc<InternalStorage>,
        ignore: IgnoreRegistry,
        employee: Employee,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let local = temp.path().join("local");
        std::fs::create_dir_all(&local).unwrap();
        let storage = InternalStorage::open(temp.path().join("storage")).unwrap();
        let ignore = IgnoreRegistry::new(Duration::from_secs(2));
        let employee = Employee::new(
            Arc::new(storage.client("laptop")),
            &local,
            ignore.clone(),
        );
        Fixture {
            _temp: temp,
            local,
            storage,
            ignore,
            employee,
        }
    }

    fn file(path: &str, is_directory: bool) -> GbFile {
        GbFile::from_relative_path(path, is_directory).unwrap()
    }

    fn put_remote(storage: &InternalStorage, path: &str, content: &str) {
        let target = storage.root().join(path);
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(target, content).unwrap();
    }

    #[tokio::test]
    async fn test_download_file_aligns_mtime() {
        let fx = fixture();
        put_remote(&fx.storage, "a.txt", "remote content");

        let derived = fx
            .employee
            .execute(&Work::new(WorkKind::Download, file("a.txt", false)))
            .await
            .unwrap();
        assert!(derived.is_empty());

        let local = fx.local.join("a.txt");
        assert_eq!(std::fs::read_to_string(&local).unwrap(), "remote content");
        let remote_time = std::fs::metadata(fx.storage.root().join("a.txt")).unwrap().modified().unwrap();
        let local_time = std::fs::metadata(&local).unwrap().modified().unwrap();
        assert_eq!(from_system_time(remote_time), from_system_time(local_time));
        assert!(std::fs::read_dir(&fx.local)
            .unwrap()
            .all(|entry| !is_partial(&entry.unwrap().file_name().to_string_lossy())));

        // The write is still covered by the grace window
        assert!(fx.ignore.should_swallow(&local, Some(local_time), Instant::now()));
        assert!(!fx.ignore.should_swallow(
            &local,
            Some(SystemTime::now() + Duration::from_secs(60)),
            Instant::now()
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_overlapping_downloads_of_one_file_both_succeed() {
        let fx = fixture();
        let content = "x".repeat(256 * 1024);
        put_remote(&fx.storage, "shared.txt", &content);

        let first = Work::new(WorkKind::Download, file("shared.txt", false));
        let second = Work::new(WorkKind::Download, file("shared.txt", false));
        let (a, b) = tokio::join!(fx.employee.execute(&first), fx.employee.execute(&second));
        a.unwrap();
        b.unwrap();

        assert_eq!(std::fs::read_to_string(fx.local.join("shared.txt")).unwrap(), content);
        assert!(std::fs::read_dir(&fx.local)
            .unwrap()
            .all(|entry| !is_partial(&entry.unwrap().file_name().to_string_lossy())));
    }

    #[tokio::test]
    async fn test_download_directory_derives_children() {
        let fx = fixture();
        put_remote(&fx.storage, "docs/one.txt", "1");
        put_remote(&fx.storage, "docs/sub/two.txt", "2");

        let derived = fx
            .employee
            .execute(&Work::new(WorkKind::Download, file("docs", true)))
            .await
            .unwrap();

        assert!(fx.local.join("docs").is_dir());
        let names: Vec<_> = derived.iter().map(|work| work.file.display_path()).collect();
        assert_eq!(names, vec!["/docs/one.txt", "/docs/sub"]);
        assert!(derived.iter().all(|work| work.kind == WorkKind::Download));
        assert!(derived[1].file.is_directory);
    }

    #[tokio::test]
    async fn test_upload_file_and_directory() {
        let fx = fixture();
        std::fs::create_dir_all(fx.local.join("dir")).unwrap();
        std::fs::write(fx.local.join("dir/inner.txt"), "inner").unwrap();
        std::fs::write(fx.local.join("dir/inner.txt.gbsync-part"), "junk").unwrap();

        let derived = fx
            .employee
            .execute(&Work::new(WorkKind::Upload, file("dir", true)))
            .await
            .unwrap();
        assert!(fx.storage.root().join("dir").is_dir());
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].file.display_path(), "/dir/inner.txt");

        fx.employee.execute(&derived[0]).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(fx.storage.root().join("dir/inner.txt")).unwrap(),
            "inner"
        );
    }

    #[tokio::test]
    async fn test_upload_of_vanished_file_is_noop() {
        let fx = fixture();
        let derived = fx
            .employee
            .execute(&Work::new(WorkKind::Upload, file("gone.txt", false)))
            .await
            .unwrap();
        assert!(derived.is_empty());
        assert_eq!(fx.storage.last_event_id(), 0);
    }

    #[tokio::test]
    async fn test_remove_in_client_tolerates_missing_path() {
        let fx = fixture();
        std::fs::write(fx.local.join("x.txt"), "x").unwrap();

        let work = Work::new(WorkKind::RemoveInClient, file("x.txt", false));
        fx.employee.execute(&work).await.unwrap();
        assert!(!fx.local.join("x.txt").exists());
        fx.employee.execute(&work).await.unwrap();

        let root = Work::new(WorkKind::RemoveInClient, GbFile::root());
        assert!(fx.employee.execute(&root).await.is_err());
    }

    #[tokio::test]
    async fn test_move_in_client_renames_then_refreshes() {
        let fx = fixture();
        std::fs::write(fx.local.join("old.txt"), "stale").unwrap();
        filetime::set_file_mtime(
            fx.local.join("old.txt"),
            filetime::FileTime::from_unix_time(1_000_000, 0),
        )
        .unwrap();
        put_remote(&fx.storage, "new.txt", "fresh");

        let work = Work::moved(
            WorkKind::MoveInClient,
            file("old.txt", false),
            file("new.txt", false),
        );
        fx.employee.execute(&work).await.unwrap();

        assert!(!fx.local.join("old.txt").exists());
        assert_eq!(std::fs::read_to_string(fx.local.join("new.txt")).unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_storage_side_moves_and_removes() {
        let fx = fixture();
        put_remote(&fx.storage, "a.txt", "a");

        let moved = Work::moved(WorkKind::MoveInStorage, file("a.txt", false), file("b.txt", false));
        fx.employee.execute(&moved).await.unwrap();
        assert!(fx.storage.root().join("b.txt").exists());

        let removed = Work::new(WorkKind::RemoveInStorage, file("b.txt", false));
        fx.employee.execute(&removed).await.unwrap();
        assert!(!fx.storage.root().join("b.txt").exists());

        let no_source = Work::new(WorkKind::MoveInStorage, file("c.txt", false));
        assert!(matches!(
            fx.employee.execute(&no_source).await,
            Err(SyncError::InvalidWork(_))
        ));
    }
}
