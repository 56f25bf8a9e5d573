//! Filesystem entity model shared by the engine and the storage clients

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

/// Opaque identifier the storage assigns to a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub i64);

impl FileId {
    /// Id of a file the storage has not registered (yet)
    pub const UNKNOWN: FileId = FileId(-1);
    /// Id of the storage root
    pub const ROOT: FileId = FileId(0);

    pub fn is_known(self) -> bool {
        self.0 >= 0
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_known() {
            write!(f, "{}", self.0)
        } else {
            f.write_str("unknown")
        }
    }
}

/// A file or directory, identified either by id/father id or by its path
/// segments below the sync root.
///
/// A file knows its father id, its path, or neither; in the last case it was
/// just created locally and the storage has never seen it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GbFile {
    #[serde(default)]
    pub id: FileId,
    #[serde(default)]
    pub father_id: FileId,
    pub name: String,
    pub is_directory: bool,
    #[serde(default)]
    pub size: u64,
    #[serde(default = "epoch")]
    pub creation_time: DateTime<Utc>,
    #[serde(default = "epoch")]
    pub last_update_time: DateTime<Utc>,
    /// Ancestor names, root first, ending with this file's own name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<String>>,
}

/// Remote view of a file as returned by a storage lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file: GbFile,
    /// Filled for directories only, sorted by name
    #[serde(default)]
    pub children: Vec<GbFile>,
}

impl FileMetadata {
    pub fn new(file: GbFile) -> Self {
        Self {
            file,
            children: Vec::new(),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.file.is_directory
    }
}

fn epoch() -> DateTime<Utc> {
    Utc.timestamp_millis_opt(0).single().unwrap_or_default()
}

/// Truncate a timestamp to millisecond precision, the resolution the
/// storage keeps.
pub fn truncate_millis(time: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(time.timestamp_millis())
        .single()
        .unwrap_or(time)
}

/// Convert a filesystem timestamp to the storage resolution
pub fn from_system_time(time: SystemTime) -> DateTime<Utc> {
    truncate_millis(DateTime::<Utc>::from(time))
}

/// Set the modification time of a local entry
pub fn set_local_mtime(path: &Path, time: DateTime<Utc>) -> std::io::Result<()> {
    let mtime = filetime::FileTime::from_unix_time(
        time.timestamp(),
        time.timestamp_subsec_nanos(),
    );
    filetime::set_file_mtime(path, mtime)
}

/// Split a relative path into plain name segments. Returns `None` for paths
/// that escape the root or carry a prefix.
pub fn segments_of(relative: &Path) -> Option<Vec<String>> {
    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(name) => segments.push(name.to_str()?.to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(segments)
}

impl GbFile {
    /// The sync root
    pub fn root() -> Self {
        Self {
            id: FileId::ROOT,
            father_id: FileId::UNKNOWN,
            name: String::new(),
            is_directory: true,
            size: 0,
            creation_time: epoch(),
            last_update_time: epoch(),
            path: Some(Vec::new()),
        }
    }

    /// An unregistered file known only by its path
    pub fn from_segments(segments: Vec<String>, is_directory: bool) -> Self {
        Self {
            id: FileId::UNKNOWN,
            father_id: FileId::UNKNOWN,
            name: segments.last().cloned().unwrap_or_default(),
            is_directory,
            size: 0,
            creation_time: epoch(),
            last_update_time: epoch(),
            path: Some(segments),
        }
    }

    pub fn from_relative_path(relative: impl AsRef<Path>, is_directory: bool) -> Option<Self> {
        segments_of(relative.as_ref()).map(|segments| Self::from_segments(segments, is_directory))
    }

    /// Build a file for `path` below `root`, filling size, type and
    /// timestamps from disk when the entry exists.
    pub fn from_local_path(root: &Path, path: &Path) -> Option<Self> {
        let relative = path.strip_prefix(root).ok()?;
        let mut file = Self::from_relative_path(relative, false)?;
        if let Ok(metadata) = std::fs::symlink_metadata(path) {
            file.apply_local_metadata(&metadata);
        }
        Some(file)
    }

    /// Copy type, size and timestamps from local filesystem metadata
    pub fn apply_local_metadata(&mut self, metadata: &std::fs::Metadata) {
        self.is_directory = metadata.is_dir();
        self.size = if metadata.is_dir() { 0 } else { metadata.len() };
        if let Ok(modified) = metadata.modified() {
            self.last_update_time = from_system_time(modified);
        }
        self.creation_time = metadata
            .created()
            .map(from_system_time)
            .unwrap_or(self.last_update_time);
    }

    /// A child of this directory. The child inherits a path when this file
    /// has one, and always records this file's id as its father.
    pub fn child(&self, name: impl Into<String>, is_directory: bool) -> Self {
        let name = name.into();
        let path = self.path.as_ref().map(|segments| {
            let mut segments = segments.clone();
            segments.push(name.clone());
            segments
        });
        Self {
            id: FileId::UNKNOWN,
            father_id: self.id,
            name,
            is_directory,
            size: 0,
            creation_time: epoch(),
            last_update_time: epoch(),
            path,
        }
    }

    pub fn path_segments(&self) -> Option<&[String]> {
        self.path.as_deref()
    }

    pub fn relative_path(&self) -> Option<PathBuf> {
        self.path
            .as_ref()
            .map(|segments| segments.iter().collect::<PathBuf>())
    }

    pub fn to_local_path(&self, root: &Path) -> Option<PathBuf> {
        self.relative_path().map(|relative| root.join(relative))
    }

    pub fn is_root(&self) -> bool {
        match &self.path {
            Some(segments) => segments.is_empty(),
            None => self.id == FileId::ROOT,
        }
    }

    /// Take over the identity and timestamps the storage reports, keeping
    /// the locally known path.
    pub fn with_metadata(&self, remote: &GbFile) -> Self {
        Self {
            id: remote.id,
            father_id: remote.father_id,
            name: self.name.clone(),
            is_directory: remote.is_directory,
            size: remote.size,
            creation_time: remote.creation_time,
            last_update_time: remote.last_update_time,
            path: self.path.clone().or_else(|| remote.path.clone()),
        }
    }

    /// `/a/b/c` style rendering for logs
    pub fn display_path(&self) -> String {
        match &self.path {
            Some(segments) => format!("/{}", segments.join("/")),
            None => format!("#{}/{}", self.father_id, self.name),
        }
    }
}

impl fmt::Display for GbFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_child_extends_path_and_father() {
        let root = GbFile::root();
        let dir = root.child("docs", true);
        let file = dir.child("a.txt", false);

        assert_eq!(dir.father_id, FileId::ROOT);
        assert_eq!(file.path_segments().unwrap(), ["docs", "a.txt"]);
        assert_eq!(file.relative_path().unwrap(), PathBuf::from("docs").join("a.txt"));
        assert_eq!(file.display_path(), "/docs/a.txt");
    }

    #[test]
    fn test_segments_reject_parent_components() {
        assert!(segments_of(Path::new("a/../b")).is_none());
        assert_eq!(segments_of(Path::new("./a/b")).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_from_local_path_reads_metadata() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("sub").join("note.txt");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"hello").unwrap();

        let file = GbFile::from_local_path(temp.path(), &path).unwrap();
        assert!(!file.is_directory);
        assert_eq!(file.size, 5);
        assert_eq!(file.name, "note.txt");
        assert!(file.last_update_time.timestamp_millis() > 0);

        let dir = GbFile::from_local_path(temp.path(), &temp.path().join("sub")).unwrap();
        assert!(dir.is_directory);

        assert!(GbFile::from_local_path(temp.path(), Path::new("/elsewhere")).is_none());
    }

    #[test]
    fn test_missing_local_path_keeps_defaults() {
        let temp = TempDir::new().unwrap();
        let file = GbFile::from_local_path(temp.path(), &temp.path().join("gone.txt")).unwrap();
        assert_eq!(file.size, 0);
        assert_eq!(file.last_update_time.timestamp_millis(), 0);
    }

    #[test]
    fn test_root_detection() {
        assert!(GbFile::root().is_root());
        assert!(!GbFile::root().child("x", false).is_root());
    }

    #[test]
    fn test_serde_uses_camel_case() {
        let file = GbFile::root().child("a.txt", false);
        let json = serde_json::to_value(&file).unwrap();
        assert!(json.get("fatherId").is_some());
        assert!(json.get("lastUpdateTime").is_some());
        let back: GbFile = serde_json::from_value(json).unwrap();
        assert_eq!(back, file);
    }
}
