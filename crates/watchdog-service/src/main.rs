use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;
use watchdog_core::paths::{config_path, exports_dir, log_dir};
use watchdog_core::settings::WatchdogSettings;
use watchdog_core::signing::KeyStore;
use watchdog_service::alerting::AlertDispatcher;
use watchdog_service::integrity::monitor::{self, MonitorConfig};
use watchdog_service::IntegrityService;

#[derive(Parser, Debug)]
#[command(author, version, about = "File integrity watchdog", long_about = None)]
struct Cli {
    /// Settings file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write default settings, create data directories and generate keys
    Init,
    /// Scan and record a fresh baseline
    Baseline {
        #[arg(long = "dir")]
        dirs: Vec<PathBuf>,
        #[arg(long = "ext")]
        exts: Vec<String>,
    },
    /// Verify every tracked file once
    Verify,
    /// Verify a single tracked file
    VerifyFile { path: PathBuf },
    /// Export the baseline document as JSON
    Export {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Show statistics and status counts
    Status,
    /// Run the monitor loop until interrupted
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    let config = match cli.config {
        Some(p) => p,
        None => config_path()?,
    };
    match cli.command {
        Commands::Init => init_command(&config),
        Commands::Baseline { dirs, exts } => baseline_command(&config, dirs, exts).await,
        Commands::Verify => verify_command(&config).await,
        Commands::VerifyFile { path } => verify_file_command(&config, &path).await,
        Commands::Export { output } => export_command(&config, output).await,
        Commands::Status => status_command(&config).await,
        Commands::Run => run_command(&config).await,
    }
}

fn load_settings(config: &Path) -> Result<WatchdogSettings> {
    WatchdogSettings::load(config)
        .with_context(|| format!("loading settings from {}", config.display()))
}

fn open_service(config: &Path) -> Result<Arc<IntegrityService>> {
    let settings = load_settings(config)?;
    let dispatcher = Arc::new(AlertDispatcher::from_settings(&settings.alerting));
    info!(channels = ?dispatcher.channel_names(), "alert channels configured");
    let service = IntegrityService::open(settings, dispatcher).context("opening integrity service")?;
    Ok(Arc::new(service))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_command(config: &Path) -> Result<()> {
    let settings = load_settings(config)?;
    if !config.exists() {
        settings.save(config)?;
        println!("Settings written to {}", config.display());
    }
    std::fs::create_dir_all(log_dir()?)?;
    std::fs::create_dir_all(exports_dir()?)?;
    if let Some(parent) = settings.baseline_path()?.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let keys = KeyStore::load_or_create(&settings.keys_dir()?).context("preparing signing keys")?;
    println!("Keys directory: {}", keys.dir().display());
    println!("Public key: {}", keys.public_key_hex());
    Ok(())
}

/// Directories a baseline command scans: `--dir` values, else the configured
/// ones. Refuses an empty set so an existing baseline is never replaced by
/// an empty one.
fn scan_roots(settings: &WatchdogSettings, dirs: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
    let dirs = if dirs.is_empty() {
        settings.monitored_dirs.clone()
    } else {
        dirs
    };
    if dirs.is_empty() {
        return Err(anyhow!("no directories to scan; pass --dir or set monitored_dirs"));
    }
    Ok(dirs)
}

async fn baseline_command(config: &Path, dirs: Vec<PathBuf>, exts: Vec<String>) -> Result<()> {
    let service = open_service(config)?;
    let use_settings = dirs.is_empty() && exts.is_empty();
    let dirs = scan_roots(service.settings(), dirs)?;
    let summary = if use_settings {
        service.create_baseline_from_settings().await?
    } else {
        service.create_baseline(dirs, exts).await?
    };
    print_json(&summary)
}

async fn verify_command(config: &Path) -> Result<()> {
    let service = open_service(config)?;
    let summary = service.verify_all().await?;
    print_json(&summary)
}

async fn verify_file_command(config: &Path, path: &Path) -> Result<()> {
    let service = open_service(config)?;
    let verdict = service
        .verify_one(path)
        .await
        .with_context(|| format!("verifying {}", path.display()))?;
    print_json(&verdict)
}

async fn export_command(config: &Path, output: Option<PathBuf>) -> Result<()> {
    let service = open_service(config)?;
    match output {
        Some(path) => {
            service.export_to(&path).await?;
            println!("Exported to {}", path.display());
        }
        None => println!("{}", service.export_snapshot().await?),
    }
    Ok(())
}

async fn status_command(config: &Path) -> Result<()> {
    let service = open_service(config)?;
    print_json(&serde_json::json!({
        "statistics": service.statistics().await,
        "statusCounts": service.status_counts().await,
        "signing": service.key_store().map(|k| k.public_key_hex()),
    }))
}

async fn run_command(config: &Path) -> Result<()> {
    let service = open_service(config)?;
    let handle = monitor::start(service.clone(), MonitorConfig::from_settings(service.settings()))?;
    info!("watchdog running; press Ctrl-C to stop");
    signal::ctrl_c().await?;
    info!("shutdown requested");
    handle.stop().await;
    Ok(())
}
