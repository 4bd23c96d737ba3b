//! iot-session - MQTT device session over TLS

use clap::{Parser, Subcommand};
use iot_session::config::DeviceConfig;
use iot_session::observability::{init_logging, parse_level, LogFormat};
use iot_session::runner::Supervisor;
use iot_session::session::{drive_indicator, LogIndicator};
use iot_session::transport::TlsTransport;
use std::path::PathBuf;
use std::process;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, Level};

/// MQTT device session over TLS
#[derive(Parser)]
#[command(name = "iot-session")]
#[command(about = "Connect a device to an MQTT broker over TLS")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "IOT_SESSION_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and service the session until SIGINT or SIGTERM.
    /// SIGUSR1 publishes the next counter value.
    Run,
    /// Validate configuration
    Config {
        /// Show the configuration with secrets masked
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    init_cli_logging(cli.verbose);

    info!("Starting iot-session v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_session(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Shutdown complete");
}

fn init_cli_logging(verbose: u8) {
    let level = match verbose {
        0 => parse_level(&std::env::var("LOG_LEVEL").unwrap_or_default()),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let format = LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_default());
    let include_spans = std::env::var("LOG_SPANS")
        .map(|v| iot_session::observability::logging::parse_spans_flag(&v))
        .unwrap_or(false);
    init_logging(level, format, include_spans);
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<DeviceConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(DeviceConfig::load_from_file(path)?);
    }

    for path_str in ["device.toml", "config/device.toml", "/etc/iot-session/device.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(DeviceConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create device.toml".into())
}

async fn run_session(config: DeviceConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        device_id = %config.identity.device_id,
        backend = config.server.backend.name(),
        "Device starting"
    );

    let supervisor = Supervisor::from_config(&config)?;
    let stimulus = supervisor.stimulus_handle();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let indicator = tokio::spawn(drive_indicator(
        supervisor.state_receiver(),
        LogIndicator::new(),
    ));

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigusr1.recv() => stimulus.trigger(),
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully...");
                    break;
                }
            }
        }
        shutdown_tx.send_replace(true);
    });

    let result = supervisor
        .supervise(TlsTransport::new, shutdown_rx, |message| {
            info!(
                topic = %message.topic,
                payload = %String::from_utf8_lossy(&message.payload),
                "Message arrived"
            );
        })
        .await;

    drop(supervisor);
    indicator.abort();

    let stats = result?;
    info!(
        connects = stats.connects,
        published = stats.messages_published,
        received = stats.messages_received,
        "Session statistics"
    );
    Ok(())
}

fn handle_config_command(
    config: &DeviceConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", config.redacted_toml()?);
    }

    info!("Configuration validation complete");
    Ok(())
}
