//! MQTT session runner - main entry point
//!
//! Loads configuration and credential files, then drives one session run:
//! publish, subscribe, or both. Ctrl-C cancels the run; the session is
//! always disconnected before exit.

use clap::{Parser, Subcommand};
use mqtt_session::config::SessionConfig;
use mqtt_session::driver::{RunMode, SessionDriver};
use mqtt_session::observability::init_default_logging;
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// TLS-secured MQTT session runner
#[derive(Parser)]
#[command(name = "mqtt-session")]
#[command(about = "Publish and subscribe over a TLS-secured MQTT session")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send the configured message sequence, then disconnect
    Publish,
    /// Listen on the configured topic for the configured window
    Subscribe,
    /// Publish and subscribe concurrently over one session
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting mqtt-session v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Publish => run_session(config, RunMode::Publish).await,
        Commands::Subscribe => run_session(config, RunMode::Subscribe).await,
        Commands::Run => run_session(config, RunMode::Both).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<SessionConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(SessionConfig::load_from_file(path)?)
        }
        None => {
            let default_paths = vec!["session.toml", "config/session.toml"];

            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(SessionConfig::load_from_file(&path)?);
                }
            }

            Err("No configuration file found. Provide one with -c/--config or create session.toml"
                .into())
        }
    }
}

async fn run_session(
    config: SessionConfig,
    mode: RunMode,
) -> Result<(), Box<dyn std::error::Error>> {
    let ca_pem = read_credential(&config.tls.ca_file)?;
    let cert_pem = read_credential(&config.tls.cert_file)?;
    let key_pem = read_credential(&config.tls.key_file)?;

    let driver = SessionDriver::new(config, ca_pem, cert_pem, key_pem);

    // SIGINT/SIGTERM raise the cancellation flag; the driver disconnects
    // cleanly before exit
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => warn!("Received SIGINT, cancelling run"),
            _ = sigterm.recv() => warn!("Received SIGTERM, cancelling run"),
        }
        let _ = cancel_tx.send(true);
    });

    let summary = driver.run(mode, cancel_rx).await?;
    info!(
        published = summary.published,
        received = summary.received,
        "Run complete"
    );
    Ok(())
}

fn read_credential(path: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    std::fs::read(Path::new(path)).map_err(|e| format!("Failed to read {path}: {e}").into())
}

fn handle_config_command(
    config: SessionConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
