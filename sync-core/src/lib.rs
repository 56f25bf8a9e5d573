//! Core synchronization library
//!
//! This crate provides the pieces shared by the sync engine and its hosts:
//! the file model, storage change events and the [`api::Client`] capability
//! with its in-process and HTTP variants.

pub mod api;
pub mod event;
pub mod file;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use api::{
    Client, ClientError, EventStream, FileSource, HttpClient, InternalClient, InternalStorage, Result,
    UploadSource,
};
pub use event::{SyncEvent, SyncEventKind};
pub use file::{FileId, FileMetadata, GbFile};

/// Which storage variant to talk to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Storage node living in this process, backed by a local directory
    Internal { path: PathBuf },
    /// Remote storage node
    Remote {
        url: String,
        #[serde(default)]
        token: Option<String>,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Remote {
            url: "http://localhost:8090".to_string(),
            token: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl StorageConfig {
    /// Build the configured client variant
    pub fn connect(&self, client_id: &str) -> Result<Arc<dyn Client>> {
        match self {
            StorageConfig::Internal { path } => {
                let storage = InternalStorage::open(path)?;
                Ok(Arc::new(storage.client(client_id)))
            }
            StorageConfig::Remote {
                url,
                token,
                timeout_secs,
            } => {
                let client = api::HttpClientBuilder::new(url)
                    .client_id(client_id)
                    .token(token.clone())
                    .timeout(Duration::from_secs(*timeout_secs))
                    .build()?;
                Ok(Arc::new(client))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_config_default() {
        let config = StorageConfig::default();
        assert!(matches!(config, StorageConfig::Remote { ref url, .. } if url == "http://localhost:8090"));
    }

    #[test]
    fn test_internal_storage_connects() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = StorageConfig::Internal {
            path: temp.path().join("storage"),
        };
        let client = config.connect("laptop").unwrap();
        assert_eq!(client.client_id(), "laptop");
        assert!(temp.path().join("storage").is_dir());
    }
}
