//! Reconciliation walk between the local tree and the storage
//!
//! The walk visits the local and remote trees together, depth first, with an
//! explicit stack. For every node it decides whether content must go up,
//! come down, or nothing at all, and yields the resulting [`Work`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use gbsync_core::file::truncate_millis;
use gbsync_core::{Client, GbFile};

use crate::employee::is_partial;
use crate::error::{Result, SyncError};
use crate::work::{Work, WorkKind, WorkOrigin};

/// Read access to the local side of the sync
#[async_trait]
pub trait LocalTree: Send + Sync {
    /// `file` as it exists locally, `None` when missing
    async fn stat(&self, file: &GbFile) -> Result<Option<GbFile>>;

    /// Entries of a local directory, sorted by name
    async fn children(&self, dir: &GbFile) -> Result<Vec<GbFile>>;
}

/// [`LocalTree`] over a directory on disk
#[derive(Debug, Clone)]
pub struct DiskTree {
    root: PathBuf,
}

impl DiskTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn local_path(&self, file: &GbFile) -> Result<PathBuf> {
        file.to_local_path(&self.root)
            .ok_or_else(|| SyncError::Reconcile(format!("{} has no resolved path", file)))
    }
}

#[async_trait]
impl LocalTree for DiskTree {
    async fn stat(&self, file: &GbFile) -> Result<Option<GbFile>> {
        let path = self.local_path(file)?;
        match fs::symlink_metadata(&path).await {
            Ok(metadata) => {
                let mut found = file.clone();
                found.apply_local_metadata(&metadata);
                Ok(Some(found))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn children(&self, dir: &GbFile) -> Result<Vec<GbFile>> {
        let path = self.local_path(dir)?;
        let mut found = Vec::new();
        let mut entries = fs::read_dir(&path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = match entry.file_name().into_string() {
                Ok(name) if is_partial(&name) => continue,
                Ok(name) => name,
                Err(name) => {
                    warn!("Skipping non UTF-8 local entry {:?}", name);
                    continue;
                }
            };
            let metadata = entry.metadata().await?;
            let mut child = dir.child(name, metadata.is_dir());
            child.apply_local_metadata(&metadata);
            found.push(child);
        }
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }
}

/// What one walk did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub visited: usize,
    pub uploads: usize,
    pub downloads: usize,
    pub unchanged: usize,
    /// Branches abandoned after a lookup error
    pub skipped: usize,
    /// Nodes that are a file on one side and a directory on the other
    pub mismatches: usize,
}

impl ReconcileReport {
    pub fn work_count(&self) -> usize {
        self.uploads + self.downloads
    }
}

#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub works: Vec<Work>,
    pub report: ReconcileReport,
}

impl ReconcileOutcome {
    fn push(&mut self, kind: WorkKind, file: GbFile) {
        match kind {
            WorkKind::Upload => self.report.uploads += 1,
            WorkKind::Download => self.report.downloads += 1,
            _ => {}
        }
        debug!(kind = %kind, path = %file, "Reconciliation work");
        self.works
            .push(Work::new(kind, file).with_origin(WorkOrigin::Reconcile));
    }
}

pub struct Reconciler<'a> {
    client: &'a dyn Client,
    local: &'a dyn LocalTree,
}

impl<'a> Reconciler<'a> {
    pub fn new(client: &'a dyn Client, local: &'a dyn LocalTree) -> Self {
        Self { client, local }
    }

    /// Walk the subtree rooted at `start`. Lookup failures abandon the
    /// affected branch only.
    #[instrument(skip_all, fields(start = %start))]
    pub async fn check_r(&self, start: GbFile) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        let mut stack = vec![start];

        while let Some(node) = stack.pop() {
            outcome.report.visited += 1;

            let local = match self.local.stat(&node).await {
                Ok(local) => local,
                Err(e) => {
                    warn!(path = %node, "Cannot read local entry, skipping branch: {}", e);
                    outcome.report.skipped += 1;
                    continue;
                }
            };
            let remote = match self.client.get_info(&node).await {
                Ok(remote) => remote,
                Err(e) => {
                    warn!(path = %node, "Cannot fetch storage metadata, skipping branch: {}", e);
                    outcome.report.skipped += 1;
                    continue;
                }
            };

            let (local, remote) = match (local, remote) {
                (None, None) => continue,
                (Some(local), None) => {
                    outcome.push(WorkKind::Upload, local);
                    continue;
                }
                (None, Some(remote)) => {
                    outcome.push(WorkKind::Download, node.with_metadata(&remote.file));
                    continue;
                }
                (Some(local), Some(remote)) => (local, remote),
            };

            if local.is_directory != remote.file.is_directory {
                warn!(
                    path = %node,
                    local_is_directory = local.is_directory,
                    "Local and storage disagree on the entry type, leaving both untouched"
                );
                outcome.report.mismatches += 1;
                continue;
            }

            if !local.is_directory {
                let local_time = truncate_millis(local.last_update_time);
                let remote_time = truncate_millis(remote.file.last_update_time);
                if remote_time > local_time {
                    outcome.push(WorkKind::Download, local.with_metadata(&remote.file));
                } else if local_time > remote_time {
                    outcome.push(WorkKind::Upload, local);
                } else {
                    outcome.report.unchanged += 1;
                }
                continue;
            }

            let local_children = match self.local.children(&local).await {
                Ok(children) => children,
                Err(e) => {
                    warn!(path = %node, "Cannot list local directory, skipping branch: {}", e);
                    outcome.report.skipped += 1;
                    continue;
                }
            };

            let mut remote_only: BTreeMap<String, GbFile> = remote
                .children
                .into_iter()
                .map(|child| (child.name.clone(), child))
                .collect();
            for child in local_children.iter() {
                remote_only.remove(&child.name);
            }

            // Reversed so siblings pop in name order
            stack.extend(local_children.into_iter().rev());
            for (name, remote_child) in remote_only {
                outcome.report.visited += 1;
                let target = local.child(name, remote_child.is_directory);
                outcome.push(WorkKind::Download, target.with_metadata(&remote_child));
            }
        }

        info!(
            visited = outcome.report.visited,
            uploads = outcome.report.uploads,
            downloads = outcome.report.downloads,
            skipped = outcome.report.skipped,
            mismatches = outcome.report.mismatches,
            "Reconciliation walk finished"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use gbsync_core::{ClientError, EventStream, FileMetadata, UploadSource};
    use rstest::rstest;
    use std::collections::{HashMap, HashSet};
    use tokio::io::AsyncWrite;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    fn segments(path: &str) -> Vec<String> {
        path.split('/').filter(|s| !s.is_empty()).map(String::from).collect()
    }

    /// Flat path → entry map standing in for either side
    #[derive(Default)]
    struct MemoryTree {
        entries: HashMap<Vec<String>, GbFile>,
        broken: HashSet<Vec<String>>,
    }

    impl MemoryTree {
        fn new() -> Self {
            let mut tree = Self::default();
            tree.entries.insert(Vec::new(), GbFile::root());
            tree
        }

        fn file(mut self, path: &str, millis: i64) -> Self {
            let mut file = GbFile::from_segments(segments(path), false);
            file.last_update_time = at(millis);
            self.entries.insert(segments(path), file);
            self
        }

        fn dir(mut self, path: &str) -> Self {
            self.entries
                .insert(segments(path), GbFile::from_segments(segments(path), true));
            self
        }

        fn broken(mut self, path: &str) -> Self {
            self.broken.insert(segments(path));
            self
        }

        fn lookup(&self, file: &GbFile) -> std::result::Result<Option<GbFile>, String> {
            let key = file.path_segments().unwrap_or_default().to_vec();
            if self.broken.contains(&key) {
                return Err(format!("{} unreachable", file));
            }
            Ok(self.entries.get(&key).cloned())
        }

        fn children_of(&self, dir: &GbFile) -> Vec<GbFile> {
            let prefix = dir.path_segments().unwrap_or_default();
            let mut children: Vec<GbFile> = self
                .entries
                .iter()
                .filter(|(path, _)| path.len() == prefix.len() + 1 && path.starts_with(prefix))
                .map(|(_, file)| file.clone())
                .collect();
            children.sort_by(|a, b| a.name.cmp(&b.name));
            children
        }
    }

    #[async_trait]
    impl LocalTree for MemoryTree {
        async fn stat(&self, file: &GbFile) -> Result<Option<GbFile>> {
            self.lookup(file).map_err(SyncError::Reconcile)
        }

        async fn children(&self, dir: &GbFile) -> Result<Vec<GbFile>> {
            Ok(self.children_of(dir))
        }
    }

    #[async_trait]
    impl Client for MemoryTree {
        fn client_id(&self) -> &str {
            "memory"
        }

        async fn get_info(&self, file: &GbFile) -> gbsync_core::Result<Option<FileMetadata>> {
            let found = self.lookup(file).map_err(ClientError::Unknown)?;
            Ok(found.map(|found| FileMetadata {
                children: if found.is_directory {
                    self.children_of(&found)
                } else {
                    Vec::new()
                },
                file: found,
            }))
        }

        async fn get_file(
            &self,
            _file: &GbFile,
            _destination: &mut (dyn AsyncWrite + Unpin + Send),
        ) -> gbsync_core::Result<u64> {
            Err(ClientError::Unknown("not used by the walk".to_string()))
        }

        async fn upload_file(
            &self,
            _file: &GbFile,
            _source: &dyn UploadSource,
        ) -> gbsync_core::Result<FileMetadata> {
            Err(ClientError::Unknown("not used by the walk".to_string()))
        }

        async fn create_directory(&self, _file: &GbFile) -> gbsync_core::Result<FileMetadata> {
            Err(ClientError::Unknown("not used by the walk".to_string()))
        }

        async fn remove_file(&self, _file: &GbFile) -> gbsync_core::Result<()> {
            Err(ClientError::Unknown("not used by the walk".to_string()))
        }

        async fn move_file(
            &self,
            _source: &GbFile,
            _destination: &GbFile,
            _copy: bool,
        ) -> gbsync_core::Result<FileMetadata> {
            Err(ClientError::Unknown("not used by the walk".to_string()))
        }

        async fn subscribe(&self, _after: Option<u64>) -> gbsync_core::Result<EventStream> {
            Err(ClientError::Unknown("not used by the walk".to_string()))
        }
    }

    async fn walk(local: &MemoryTree, remote: &MemoryTree) -> ReconcileOutcome {
        Reconciler::new(remote, local).check_r(GbFile::root()).await
    }

    fn summary(outcome: &ReconcileOutcome) -> Vec<(WorkKind, String)> {
        outcome
            .works
            .iter()
            .map(|work| (work.kind, work.file.display_path()))
            .collect()
    }

    #[tokio::test]
    async fn test_local_only_file_is_uploaded_once() {
        let local = MemoryTree::new().file("a.txt", 10);
        let remote = MemoryTree::new();

        let outcome = walk(&local, &remote).await;
        assert_eq!(summary(&outcome), vec![(WorkKind::Upload, "/a.txt".to_string())]);
        assert!(outcome.works.iter().all(|work| work.origin == WorkOrigin::Reconcile));
    }

    #[tokio::test]
    async fn test_remote_only_file_is_downloaded_once() {
        let local = MemoryTree::new();
        let remote = MemoryTree::new().file("a.txt", 10);

        let outcome = walk(&local, &remote).await;
        assert_eq!(summary(&outcome), vec![(WorkKind::Download, "/a.txt".to_string())]);
        assert_eq!(outcome.works[0].file.last_update_time, at(10));
    }

    #[rstest]
    #[case::remote_newer(100, 200, Some(WorkKind::Download))]
    #[case::local_newer(200, 100, Some(WorkKind::Upload))]
    #[case::equal(150, 150, None)]
    #[tokio::test]
    async fn test_timestamps_decide_direction(
        #[case] local_millis: i64,
        #[case] remote_millis: i64,
        #[case] expected: Option<WorkKind>,
    ) {
        let local = MemoryTree::new().file("a.txt", local_millis);
        let remote = MemoryTree::new().file("a.txt", remote_millis);

        let outcome = walk(&local, &remote).await;
        let kinds: Vec<WorkKind> = outcome.works.iter().map(|work| work.kind).collect();
        assert_eq!(kinds, expected.into_iter().collect::<Vec<_>>());
        if expected.is_none() {
            assert_eq!(outcome.report.unchanged, 1);
        }
    }

    #[tokio::test]
    async fn test_local_only_directory_is_one_upload() {
        let local = MemoryTree::new()
            .dir("docs")
            .file("docs/a.txt", 1)
            .file("docs/b.txt", 1);
        let remote = MemoryTree::new();

        let outcome = walk(&local, &remote).await;
        assert_eq!(summary(&outcome), vec![(WorkKind::Upload, "/docs".to_string())]);
    }

    #[tokio::test]
    async fn test_mixed_tree_converges_both_ways() {
        let local = MemoryTree::new()
            .dir("docs")
            .file("docs/mine.txt", 5)
            .file("docs/shared.txt", 5);
        let remote = MemoryTree::new()
            .dir("docs")
            .file("docs/shared.txt", 5)
            .file("docs/theirs.txt", 5)
            .dir("photos");

        let outcome = walk(&local, &remote).await;
        let mut works = summary(&outcome);
        works.sort();
        assert_eq!(
            works,
            vec![
                (WorkKind::Download, "/docs/theirs.txt".to_string()),
                (WorkKind::Download, "/photos".to_string()),
                (WorkKind::Upload, "/docs/mine.txt".to_string()),
            ]
        );
        assert_eq!(outcome.report.unchanged, 1);
        assert_eq!(outcome.report.work_count(), 3);
    }

    #[tokio::test]
    async fn test_type_mismatch_is_skipped() {
        let local = MemoryTree::new().file("thing", 1);
        let remote = MemoryTree::new().dir("thing").file("thing/inner.txt", 1);

        let outcome = walk(&local, &remote).await;
        assert!(outcome.works.is_empty());
        assert_eq!(outcome.report.mismatches, 1);
    }

    #[tokio::test]
    async fn test_lookup_error_abandons_only_that_branch() {
        let local = MemoryTree::new()
            .dir("bad")
            .file("bad/a.txt", 1)
            .dir("good")
            .file("good/b.txt", 1);
        let remote = MemoryTree::new().dir("bad").dir("good").broken("bad");

        let outcome = walk(&local, &remote).await;
        assert_eq!(summary(&outcome), vec![(WorkKind::Upload, "/good/b.txt".to_string())]);
        assert_eq!(outcome.report.skipped, 1);
    }

    #[tokio::test]
    async fn test_disk_tree_lists_sorted_children() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("b")).unwrap();
        std::fs::write(temp.path().join("a.txt"), "a").unwrap();
        std::fs::write(temp.path().join("c.txt.gbsync-part"), "partial").unwrap();

        let tree = DiskTree::new(temp.path());
        let children = tree.children(&GbFile::root()).await.unwrap();
        let names: Vec<_> = children.iter().map(|c| (c.name.as_str(), c.is_directory)).collect();
        assert_eq!(names, vec![("a.txt", false), ("b", true)]);
        assert_eq!(children[0].size, 1);

        assert!(tree.stat(&GbFile::root().child("missing", false)).await.unwrap().is_none());
    }
}
