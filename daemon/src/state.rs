//! State the daemon keeps between runs

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonState {
    /// Newest storage event already turned into work
    pub last_event_id: Option<u64>,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}

impl DaemonState {
    /// A missing file is a first run.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Corrupt state file {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No state file, starting fresh");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Written through a sibling file, then renamed into place
    pub async fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        self.saved_at = Some(Utc::now());
        let content = serde_json::to_string_pretty(self)?;
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, content).await?;
        tokio::fs::rename(&staging, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_is_default() {
        let temp = TempDir::new().unwrap();
        let state = DaemonState::load(temp.path().join("state.json")).await.unwrap();
        assert_eq!(state.last_event_id, None);
    }

    #[tokio::test]
    async fn test_save_creates_parent_and_round_trips() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/dir/state.json");

        let mut state = DaemonState {
            last_event_id: Some(17),
            saved_at: None,
        };
        state.save(&path).await.unwrap();
        assert!(state.saved_at.is_some());
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = DaemonState::load(&path).await.unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();
        assert!(DaemonState::load(&path).await.is_err());
    }
}
