use anyhow::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use gbsync::{ReconcileReport, SyncEngine};

use crate::config::DaemonConfig;
use crate::state::DaemonState;
use crate::telemetry::{self, DaemonMetrics};

pub struct SyncDaemon {
    config: DaemonConfig,
    engine: Arc<SyncEngine>,
    metrics: DaemonMetrics,
    state: DaemonState,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl SyncDaemon {
    pub async fn new(config: DaemonConfig) -> Result<Self> {
        info!("Initializing sync daemon");

        config.validate()?;

        let state = DaemonState::load(&config.daemon.state_file).await?;
        info!(
            last_event_id = ?state.last_event_id,
            state_file = %config.daemon.state_file.display(),
            "Loaded daemon state"
        );

        let client = config.storage.connect(&config.sync.client_id)?;
        let engine = SyncEngine::new(client, config.sync_options(state.last_event_id))?;
        let metrics = DaemonMetrics::new()?;

        Ok(Self {
            config,
            engine: Arc::new(engine),
            metrics,
            state,
            tasks: Vec::new(),
        })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    #[instrument(skip(self), fields(root = %self.engine.root().display()))]
    pub async fn run(mut self) -> Result<()> {
        info!("Starting sync daemon");

        if self.config.metrics.enabled {
            self.start_metrics_server();
        }

        let report = self.engine.sync_and_start().await?;
        info!(
            uploads = report.uploads,
            downloads = report.downloads,
            mismatches = report.mismatches,
            "Initial reconciliation queued"
        );

        let mut ticker = interval(self.config.daemon.status_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Sync daemon started successfully");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.status_tick().await;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl+C received, shutting down");
                    break;
                }
            }
        }

        self.shutdown().await?;
        info!("Sync daemon stopped");
        Ok(())
    }

    /// One reconciliation pass, drained before returning
    #[instrument(skip(self), fields(root = %self.engine.root().display()))]
    pub async fn run_once(mut self) -> Result<ReconcileReport> {
        let report = self.engine.reconcile_once().await?;
        let failed = self.engine.failed_works();
        for work in &failed {
            warn!(work_id = %work.id, error = ?work.error, "Work failed: {}", work);
        }

        self.persist_state().await?;
        info!(
            uploads = report.uploads,
            downloads = report.downloads,
            failed = failed.len(),
            "{}",
            self.engine.metrics().summary()
        );
        Ok(report)
    }

    fn start_metrics_server(&mut self) {
        let address = format!(
            "{}:{}",
            self.config.metrics.bind_address, self.config.metrics.port
        );
        let app = telemetry::create_server(self.metrics.clone(), self.engine.clone());

        let handle = tokio::spawn(async move {
            if let Err(e) = telemetry::serve(address, app).await {
                error!("Metrics server failed: {}", e);
            }
        });
        self.tasks.push(("metrics_server", handle));
    }

    async fn status_tick(&mut self) {
        let snapshot = self.engine.metrics().snapshot();
        self.metrics.mirror(&snapshot);

        let status = self.engine.status();
        debug!(
            syncing = status.syncing,
            queued = status.stats.queued,
            running = status.stats.running,
            failed = status.failed_works.len(),
            "{}",
            self.engine.metrics().summary()
        );

        if let Err(e) = self.persist_state().await {
            error!("Failed to save daemon state: {}", e);
        }
    }

    /// Save the marker if it moved since the last save
    async fn persist_state(&mut self) -> Result<()> {
        let marker = self.engine.last_event_id();
        if marker.is_none() || marker == self.state.last_event_id {
            return Ok(());
        }

        self.state.last_event_id = marker;
        self.state.save(&self.config.daemon.state_file).await?;
        debug!(last_event_id = ?marker, "Saved daemon state");
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down sync daemon");

        self.engine.shutdown().await;

        for (name, handle) in self.tasks.drain(..) {
            debug!("Stopping task: {}", name);
            handle.abort();
        }

        self.metrics.mirror(&self.engine.metrics().snapshot());
        self.persist_state().await?;
        Ok(())
    }
}

impl Drop for SyncDaemon {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gbsync_core::{Client, GbFile, StorageConfig};
    use std::path::Path;
    use tempfile::TempDir;

    fn config_for(temp: &TempDir) -> DaemonConfig {
        let root = temp.path().join("local");
        std::fs::create_dir_all(&root).unwrap();

        let mut config = DaemonConfig::default();
        config.storage = StorageConfig::Internal {
            path: temp.path().join("storage"),
        };
        config.sync.root = root;
        config.sync.client_id = "laptop".to_string();
        config.daemon.state_file = temp.path().join("state/state.json");
        config.metrics.enabled = false;
        config
    }

    async fn upload(storage: &Path, relative: &str, content: &'static [u8]) {
        let client = StorageConfig::Internal {
            path: storage.to_path_buf(),
        }
        .connect("phone")
        .unwrap();
        client
            .upload_file(&GbFile::from_relative_path(relative, false).unwrap(), &content)
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_once_downloads_remote_file() {
        let temp = TempDir::new().unwrap();
        let config = config_for(&temp);
        upload(&temp.path().join("storage"), "notes.txt", b"hello").await;

        let daemon = SyncDaemon::new(config.clone()).await.unwrap();
        let report = daemon.run_once().await.unwrap();
        assert_eq!(report.downloads, 1);
        assert_eq!(
            std::fs::read_to_string(config.sync.root.join("notes.txt")).unwrap(),
            "hello"
        );

        // Nothing was heard live, so there is no marker to persist yet
        assert!(!config.daemon.state_file.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_resumes_from_saved_marker() {
        let temp = TempDir::new().unwrap();
        let config = config_for(&temp);

        let mut state = DaemonState {
            last_event_id: Some(7),
            saved_at: None,
        };
        state.save(&config.daemon.state_file).await.unwrap();

        let daemon = SyncDaemon::new(config).await.unwrap();
        assert_eq!(daemon.engine().options().last_event_id, Some(7));
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let temp = TempDir::new().unwrap();
        let mut config = config_for(&temp);
        config.sync.max_concurrency = 0;
        assert!(SyncDaemon::new(config).await.is_err());
    }
}
