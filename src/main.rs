//! hot-updater CLI
//!
//! A small host harness around the update engine. Events are printed to
//! stdout as JSON lines, results as pretty JSON; logs go to stderr.
//!
//! Each invocation is a fresh process and opening the engine counts as a
//! launch of a pending bundle. A pending bundle that is not confirmed before
//! the process exits is rolled back on the next start.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use hot_updater::config::{default_config_path, EngineConfig};
use hot_updater::logging::{LogLevel, LoggingSystem};
use hot_updater::update::{HotUpdater, UpdateEngine, UpdateEvent, UpdateRequest};
use hot_updater::BundleId;

#[derive(Parser)]
#[command(name = "hot-updater")]
#[command(author, version, about = "Over-the-air bundle update engine", long_about = None)]
struct Cli {
    /// Configuration file (default: <config dir>/hot-updater/config.json if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download, verify and activate a bundle
    Update {
        /// Bundle id to install
        bundle_id: String,

        /// Archive URL; without it only check whether an update exists
        #[arg(short, long)]
        zip_url: Option<String>,

        /// Expected SHA256 of the archive (default: from the manifest)
        #[arg(long)]
        checksum: Option<String>,
    },

    /// Ask the update server for a newer bundle
    Check {
        /// Install the offered bundle
        #[arg(short, long)]
        install: bool,
    },

    /// Print MIN_BUNDLE_ID, APP_VERSION and CHANNEL
    Constants,

    /// Switch the release channel
    SetChannel { channel: String },

    /// Confirm that the pending bundle started correctly
    Confirm { bundle_id: String },

    /// Revert to the previous bundle
    Rollback,

    /// Request a reload of the active bundle
    Reload {
        /// Confirm the reloaded bundle right away
        #[arg(long)]
        confirm: bool,
    },

    /// Print the update record and bundle slots
    Status,

    /// Remove unused slots and stale partial downloads
    Gc,
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let path = match &cli.config {
        Some(path) => Some(path.clone()),
        None => Some(default_config_path()).filter(|p| p.exists()),
    };
    let mut config = EngineConfig::load(path.as_deref()).with_context(|| match &path {
        Some(path) => format!("Failed to load configuration from {}", path.display()),
        None => "Failed to load configuration".to_string(),
    })?;
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let mut logging_config = config.logging_config();
    if cli.verbose {
        logging_config = logging_config.with_level(LogLevel::Debug);
    }
    let _logging_system = match LoggingSystem::init(logging_config) {
        Ok(system) => Some(system),
        Err(e) => {
            eprintln!("Failed to initialize logging system: {}", e);
            None
        }
    };

    let engine = HotUpdater::open(config)
        .await
        .context("Failed to open update engine")?;
    engine.add_listener(Arc::new(|event: &UpdateEvent| {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{}", line);
        }
    }));

    let outcome = run(&engine, cli.command).await;
    engine.shutdown();
    outcome
}

async fn run(engine: &HotUpdater, command: Commands) -> Result<()> {
    match command {
        Commands::Update {
            bundle_id,
            zip_url: None,
            ..
        } => {
            let available = engine.update_bundle(&bundle_id, None).await;
            print_json(&serde_json::json!({ "updateAvailable": available }))?;
        }
        Commands::Update {
            bundle_id,
            zip_url: Some(zip_url),
            checksum: Some(checksum),
        } => {
            let request = UpdateRequest {
                bundle_id: BundleId::new(bundle_id)?,
                zip_url,
                checksum: Some(checksum),
            };
            let slot = engine.install(request).await.context("Update failed")?;
            print_json(&slot)?;
        }
        Commands::Update {
            bundle_id,
            zip_url: Some(zip_url),
            checksum: None,
        } => {
            if !engine.update_bundle(&bundle_id, Some(&zip_url)).await {
                anyhow::bail!("Update to bundle {} failed", bundle_id);
            }
            print_json(&serde_json::json!({ "updated": bundle_id }))?;
        }
        Commands::Check { install: false } => {
            let descriptor = engine.check().await.context("Update check failed")?;
            print_json(&descriptor)?;
        }
        Commands::Check { install: true } => {
            let slot = engine
                .check_and_update()
                .await
                .context("Update failed")?;
            print_json(&slot)?;
        }
        Commands::Constants => {
            print_json(&engine.constants())?;
        }
        Commands::SetChannel { channel } => {
            engine.set_channel(&channel).await?;
            print_json(&engine.constants())?;
        }
        Commands::Confirm { bundle_id } => {
            let confirmed = engine.confirm_healthy(&bundle_id).await?;
            print_json(&serde_json::json!({ "confirmed": confirmed }))?;
        }
        Commands::Rollback => {
            let rolled_back = engine.rollback().await?;
            print_json(&serde_json::json!({ "rolledBack": rolled_back }))?;
        }
        Commands::Reload { confirm } => {
            let target = engine.reload().await?;
            let mut confirmed = false;
            if confirm {
                if let Some(bundle_id) = &target.bundle_id {
                    confirmed = engine.confirm_healthy(bundle_id.as_str()).await?;
                }
            }
            print_json(&serde_json::json!({
                "bundleId": target.bundle_id,
                "entryPoint": target.entry_point,
                "confirmed": confirmed,
            }))?;
        }
        Commands::Status => {
            print_json(&engine.status()?)?;
        }
        Commands::Gc => {
            print_json(&engine.gc().await?)?;
        }
    }
    Ok(())
}
