use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use gbsync::SyncOptions;
use gbsync_core::StorageConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub daemon: DaemonSettings,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Local directory kept in sync
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Origin this machine stamps on its storage changes
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_grace_period", with = "humantime_serde")]
    pub grace_period: Duration,
    #[serde(default = "default_pair_window", with = "humantime_serde")]
    pub pair_window: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonSettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub log_rotation: LogRotation,
    /// Where the last processed storage event id survives restarts
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_status_interval", with = "humantime_serde")]
    pub status_interval: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Daily,
    Hourly,
    Never,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            sync: SyncSettings::default(),
            daemon: DaemonSettings::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            root: default_root(),
            client_id: default_client_id(),
            max_concurrency: default_max_concurrency(),
            grace_period: default_grace_period(),
            pair_window: default_pair_window(),
        }
    }
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: None,
            log_rotation: LogRotation::default(),
            state_file: default_state_file(),
            status_interval: default_status_interval(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            bind_address: default_bind_address(),
            port: default_metrics_port(),
        }
    }
}

impl DaemonConfig {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: DaemonConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        match &self.storage {
            StorageConfig::Remote { url, .. } => {
                url::Url::parse(url)?;
            }
            StorageConfig::Internal { path } => {
                if path.as_os_str().is_empty() {
                    anyhow::bail!("Internal storage path cannot be empty");
                }
            }
        }

        if !self.sync.root.is_dir() {
            anyhow::bail!("Sync root does not exist: {}", self.sync.root.display());
        }
        if self.sync.client_id.trim().is_empty() {
            anyhow::bail!("Client id cannot be empty");
        }
        if self.sync.max_concurrency == 0 {
            anyhow::bail!("max_concurrency must be at least 1");
        }
        if self.daemon.status_interval.is_zero() {
            anyhow::bail!("status_interval must be greater than zero");
        }

        if self.metrics.enabled {
            format!("{}:{}", self.metrics.bind_address, self.metrics.port)
                .parse::<std::net::SocketAddr>()?;
        }

        Ok(())
    }

    /// Engine options for this configuration, resuming after `last_event_id`
    pub fn sync_options(&self, last_event_id: Option<u64>) -> SyncOptions {
        SyncOptions {
            root: self.sync.root.clone(),
            max_concurrency: self.sync.max_concurrency,
            grace_period: self.sync.grace_period,
            pair_window: self.sync.pair_window,
            last_event_id,
        }
    }
}

// Default value functions
fn default_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("GbSync")
}

fn default_client_id() -> String {
    format!("gbsync-{}", uuid::Uuid::new_v4().simple())
}

fn default_max_concurrency() -> usize { gbsync::work_manager::DEFAULT_MAX_CONCURRENCY }
fn default_grace_period() -> Duration { gbsync::watcher::DEFAULT_GRACE_PERIOD }
fn default_pair_window() -> Duration { gbsync::watcher::DEFAULT_PAIR_WINDOW }

fn default_log_level() -> String { "info".to_string() }

fn default_state_file() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gbsync")
        .join("state.json")
}

fn default_status_interval() -> Duration { Duration::from_secs(30) }

fn default_metrics_enabled() -> bool { true }
fn default_bind_address() -> String { "127.0.0.1".to_string() }
fn default_metrics_port() -> u16 { 9090 }

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn valid_config(temp: &TempDir) -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.sync.root = temp.path().to_path_buf();
        config
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: DaemonConfig = toml::from_str("").unwrap();
        assert_eq!(config.sync.max_concurrency, default_max_concurrency());
        assert_eq!(config.daemon.status_interval, Duration::from_secs(30));
        assert_eq!(config.daemon.log_rotation, LogRotation::Daily);
        assert!(config.sync.client_id.starts_with("gbsync-"));
        assert!(matches!(config.storage, StorageConfig::Remote { .. }));
    }

    #[test]
    fn test_parse_internal_storage_and_durations() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [storage]
            mode = "internal"
            path = "/srv/gbsync"

            [sync]
            root = "/home/me/GbSync"
            client_id = "laptop"
            grace_period = "5s"
            pair_window = "250ms"

            [daemon]
            log_rotation = "hourly"
            status_interval = "1m"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.storage,
            StorageConfig::Internal {
                path: PathBuf::from("/srv/gbsync")
            }
        );
        assert_eq!(config.sync.client_id, "laptop");
        assert_eq!(config.sync.grace_period, Duration::from_secs(5));
        assert_eq!(config.sync.pair_window, Duration::from_millis(250));
        assert_eq!(config.daemon.log_rotation, LogRotation::Hourly);
        assert_eq!(config.daemon.status_interval, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("gbsync.toml");
        let mut config = valid_config(&temp);
        config.daemon.log_file = Some(temp.path().join("logs/gbsync.log"));

        config.save(&path).await.unwrap();
        let loaded = DaemonConfig::load(&path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_validate_accepts_defaults_with_existing_root() {
        let temp = TempDir::new().unwrap();
        valid_config(&temp).validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let temp = TempDir::new().unwrap();

        let mut config = valid_config(&temp);
        config.storage = StorageConfig::Remote {
            url: "not a url".to_string(),
            token: None,
            timeout_secs: 30,
        };
        assert!(config.validate().is_err());

        let mut config = valid_config(&temp);
        config.sync.root = temp.path().join("missing");
        assert!(config.validate().is_err());

        let mut config = valid_config(&temp);
        config.sync.max_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config(&temp);
        config.daemon.status_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = valid_config(&temp);
        config.metrics.bind_address = "not an address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sync_options_carry_marker() {
        let temp = TempDir::new().unwrap();
        let config = valid_config(&temp);
        let options = config.sync_options(Some(42));
        assert_eq!(options.root, temp.path());
        assert_eq!(options.last_event_id, Some(42));
        assert_eq!(options.max_concurrency, config.sync.max_concurrency);
    }
}
