use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;

mod config;
mod daemon;
mod state;
mod telemetry;

use config::DaemonConfig;
use daemon::SyncDaemon;

const DEFAULT_CONFIG_FILE: &str = "gbsync.toml";

#[derive(Parser)]
#[command(name = "gbsync-daemon")]
#[command(about = "Keeps a local directory in sync with a storage node")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level, overriding the configured one
    #[arg(short, long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile, then follow both sides until interrupted
    Run,
    /// Run a single reconciliation pass and exit once its work is done
    Once,
    /// Inspect or generate the configuration
    Config {
        #[command(subcommand)]
        action: ConfigActions,
    },
}

#[derive(Subcommand)]
enum ConfigActions {
    /// Validate configuration file
    Validate,
    /// Show current configuration
    Show,
    /// Generate default configuration
    Generate {
        /// Output path for configuration
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    match cli.command {
        Commands::Run => {
            let config = load_config(&config_path).await?;
            let _guard = telemetry::init_logging(&config.daemon, cli.log_level.as_deref())?;
            let daemon = SyncDaemon::new(config).await?;
            info!(
                config = %config_path.display(),
                root = %daemon.engine().root().display(),
                "Starting gbsync daemon"
            );
            daemon.run().await
        }
        Commands::Once => {
            let config = load_config(&config_path).await?;
            let _guard = telemetry::init_logging(&config.daemon, cli.log_level.as_deref())?;
            let report = SyncDaemon::new(config).await?.run_once().await?;
            println!(
                "✓ Pass complete: {} visited, {} uploads, {} downloads, {} skipped",
                report.visited, report.uploads, report.downloads, report.skipped
            );
            Ok(())
        }
        Commands::Config { action } => match action {
            ConfigActions::Validate => validate_config(&config_path).await,
            ConfigActions::Show => show_config(&config_path).await,
            ConfigActions::Generate { output } => generate_config(output.as_ref()).await,
        },
    }
}

async fn load_config(path: &Path) -> Result<DaemonConfig> {
    if path.exists() {
        DaemonConfig::load(path).await
    } else {
        anyhow::bail!(
            "Configuration file {} not found; create one with `gbsync-daemon config generate -o {}`",
            path.display(),
            path.display()
        )
    }
}

async fn validate_config(path: &Path) -> Result<()> {
    let result = match DaemonConfig::load(path).await {
        Ok(config) => config.validate().map(|_| config),
        Err(e) => Err(e),
    };

    match result {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("Sync root: {}", config.sync.root.display());
            println!("Client id: {}", config.sync.client_id);
            Ok(())
        }
        Err(e) => {
            println!("✗ Configuration validation failed: {}", e);
            Err(e)
        }
    }
}

async fn show_config(path: &Path) -> Result<()> {
    match DaemonConfig::load(path).await {
        Ok(config) => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Err(e) => {
            println!("Failed to load configuration: {}", e);
            Err(e)
        }
    }
}

async fn generate_config(output_path: Option<&PathBuf>) -> Result<()> {
    let config = DaemonConfig::default();

    if let Some(path) = output_path {
        config.save(path).await?;
        println!("Configuration generated at {}", path.display());
    } else {
        println!("{}", toml::to_string_pretty(&config)?);
    }

    Ok(())
}
