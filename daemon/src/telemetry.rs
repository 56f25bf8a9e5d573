//! Telemetry module for logging and metrics exposure
//!
//! This module provides:
//! - Console logging plus an optional rolling JSON log file
//! - Prometheus collectors mirrored from the engine's own counters
//! - An HTTP server exposing `/metrics` and `/status`

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use parking_lot::Mutex;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gbsync::{MetricsSnapshot, SyncEngine};

use crate::config::{DaemonSettings, LogRotation};

const CRATE_TARGETS: [&str; 3] = ["gbsync", "gbsync_core", "gbsync_daemon"];

fn default_filter(level: &str) -> EnvFilter {
    let directives = CRATE_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",");
    EnvFilter::new(directives)
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
///
/// The returned guard flushes the log file and must live as long as the
/// process.
pub fn init_logging(
    settings: &DaemonSettings,
    level_override: Option<&str>,
) -> Result<Option<WorkerGuard>> {
    let level = level_override.unwrap_or(settings.log_level.as_str()).to_lowercase();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(&level));

    let console_layer = fmt::layer().with_target(true);

    let (file_layer, guard) = match &settings.log_file {
        Some(log_path) => {
            let directory = log_path.parent().unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(directory)?;
            let file_name = log_path
                .file_name()
                .unwrap_or_else(|| OsStr::new("gbsync-daemon.log"));

            let appender = match settings.log_rotation {
                LogRotation::Daily => rolling::daily(directory, file_name),
                LogRotation::Hourly => rolling::hourly(directory, file_name),
                LogRotation::Never => rolling::never(directory, file_name),
            };

            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .json()
                .with_current_span(true)
                .with_span_list(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}

/// Prometheus view of the engine counters
#[derive(Clone)]
pub struct DaemonMetrics {
    registry: Registry,
    pub works_total: IntCounterVec,
    pub works_in_flight: IntGauge,
    pub remote_events_total: IntCounterVec,
    pub watcher_events_total: IntCounterVec,
    pub reconcile_passes_total: IntCounter,
    // Serializes mirroring so two callers never add the same delta twice
    mirror_lock: Arc<Mutex<()>>,
}

impl DaemonMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let works_total = IntCounterVec::new(
            Opts::new("gbsync_works_total", "Work items that reached an end state"),
            &["kind", "outcome"],
        )?;

        let works_in_flight = IntGauge::new(
            "gbsync_works_in_flight",
            "Work items currently executing",
        )?;

        let remote_events_total = IntCounterVec::new(
            Opts::new("gbsync_remote_events_total", "Storage events received"),
            &["kind"],
        )?;

        let watcher_events_total = IntCounterVec::new(
            Opts::new("gbsync_watcher_events_total", "Local filesystem events forwarded"),
            &["kind"],
        )?;

        let reconcile_passes_total = IntCounter::new(
            "gbsync_reconcile_passes_total",
            "Completed reconciliation walks",
        )?;

        registry.register(Box::new(works_total.clone()))?;
        registry.register(Box::new(works_in_flight.clone()))?;
        registry.register(Box::new(remote_events_total.clone()))?;
        registry.register(Box::new(watcher_events_total.clone()))?;
        registry.register(Box::new(reconcile_passes_total.clone()))?;

        Ok(Self {
            registry,
            works_total,
            works_in_flight,
            remote_events_total,
            watcher_events_total,
            reconcile_passes_total,
            mirror_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Bring the collectors up to the engine's counters. Counters only move
    /// forward, so each one gains the difference.
    pub fn mirror(&self, snapshot: &MetricsSnapshot) {
        let _guard = self.mirror_lock.lock();

        for count in &snapshot.works {
            let counter = self
                .works_total
                .with_label_values(&[count.kind.as_str(), count.outcome.as_str()]);
            advance(&counter, count.count);
        }

        for (kind, count) in &snapshot.remote_events {
            advance(&self.remote_events_total.with_label_values(&[kind.as_str()]), *count);
        }

        for (kind, count) in &snapshot.watcher_events {
            advance(&self.watcher_events_total.with_label_values(&[kind.as_str()]), *count);
        }

        advance(&self.reconcile_passes_total, snapshot.reconcile_passes);
        self.works_in_flight.set(snapshot.in_flight);
    }

    pub fn encode(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

fn advance(counter: &IntCounter, target: u64) {
    let current = counter.get();
    if target > current {
        counter.inc_by(target - current);
    }
}

#[derive(Clone)]
struct ServerState {
    metrics: DaemonMetrics,
    engine: Arc<SyncEngine>,
}

/// Routes for the status server
pub fn create_server(metrics: DaemonMetrics, engine: Arc<SyncEngine>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(ServerState { metrics, engine })
}

/// Bind and serve until the task is aborted
pub async fn serve(address: String, app: Router) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("Metrics server listening on {}", address);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn metrics_handler(State(state): State<ServerState>) -> Response {
    state.metrics.mirror(&state.engine.metrics().snapshot());

    match state.metrics.encode() {
        Ok(output) => (StatusCode::OK, output).into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

async fn status_handler(State(state): State<ServerState>) -> Response {
    Json(state.engine.status()).into_response()
}
