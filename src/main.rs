//! Canister bridge - main entry point
//!
//! Loads configuration, builds the canister client and broker transport,
//! then runs the bridge until a signal or a permanent broker failure.

use canister_bridge::bridge::BridgeLifecycle;
use canister_bridge::config::BridgeConfig;
use canister_bridge::observability::{health::HealthServer, init_default_logging, metrics::metrics};
use canister_bridge::protocol::Address;
use canister_bridge::remote::{load_identity, IcServiceClient, RemoteService};
use canister_bridge::transport::mqtt::MqttClient;
use canister_bridge::transport::Transport;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::{
    signal,
    time::{sleep, Duration},
};
use tracing::{error, info};

/// Bridges an MQTT broker to Internet Computer canisters
#[derive(Parser)]
#[command(name = "canister-bridge")]
#[command(about = "MQTT to Internet Computer canister synchronization bridge")]
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
    /// Run the bridge
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Query one canister's settings and a page of its outbound messages
    Inspect {
        /// Canister address (principal text)
        address: Address,
        /// Index to read messages from
        #[arg(long, default_value_t = 0)]
        from: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting canister bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_bridge(config).await,
        Commands::Config { show } => handle_config_command(config, show),
        Commands::Inspect { address, from } => inspect_canister(config, address, from).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(BridgeConfig::load_from_file(path)?)
        }
        None => {
            let default_paths = ["bridge.toml", "config/bridge.toml"];

            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(BridgeConfig::load_from_file(&path)?);
                }
            }

            Err("No configuration file found. Provide one with -c/--config or create bridge.toml".into())
        }
    }
}

/// Identity, trust bootstrap and agent construction. Any failure is fatal.
async fn build_remote(
    config: &BridgeConfig,
) -> Result<Arc<dyn RemoteService>, Box<dyn std::error::Error>> {
    let identity = load_identity(&config.remote.identity_pem)?;
    let client: Arc<dyn RemoteService> =
        Arc::new(IcServiceClient::connect(&config.remote, identity).await?);
    Ok(client)
}

async fn build_bridge(
    config: BridgeConfig,
) -> Result<BridgeLifecycle<MqttClient>, Box<dyn std::error::Error>> {
    let remote = build_remote(&config).await?;

    let transport = MqttClient::new(
        &config.bridge.id,
        config.mqtt.clone(),
        config.bridge.presence_topic(),
        config.bridge.forward_retained,
    )
    .await?;

    Ok(BridgeLifecycle::new(config, transport, remote))
}

async fn run_bridge(config: BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Application starting with bridge ID: {}", config.bridge.id);

    let collector = metrics();
    collector.set_bridge_state("initializing");

    let health_server = config
        .health
        .as_ref()
        .map(|health| Arc::new(HealthServer::new(config.bridge.id.clone(), health.port)));

    let mut bridge = build_bridge(config).await?;

    if let Some(health_server) = &health_server {
        let server = health_server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.start().await {
                error!("Health server error: {}", e);
            }
        });
        bridge.set_health_server(health_server.clone());
    }

    bridge.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Bridge is running");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        _ = monitor_connection_health(&bridge, health_server.as_deref()) => {
            error!("Broker connection permanently lost, shutting down bridge...");
        }
    }

    info!("Application shutdown initiated");
    if let Err(e) = bridge.shutdown().await {
        error!("Error during shutdown: {}", e);
        collector.set_bridge_state("error");
        return Err(e.into());
    }

    Ok(())
}

fn handle_config_command(
    config: BridgeConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

async fn inspect_canister(
    config: BridgeConfig,
    address: Address,
    from: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let remote = build_remote(&config).await?;

    let settings = match remote.get_settings(&address).await {
        Ok(settings) => serde_json::json!({
            "interval": settings.interval,
            "owner": settings.owner.to_string(),
            "pull_enabled": settings.pull_enabled(),
        }),
        Err(e) => serde_json::json!({ "error": e.to_string() }),
    };
    let page = remote.get_messages(&address, from).await?;

    let report = serde_json::json!({
        "address": address.to_string(),
        "settings": settings,
        "messages": page,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Resolves once the broker connection is permanently lost. Also keeps the
/// health server's view of the bridge current.
async fn monitor_connection_health<T>(
    bridge: &BridgeLifecycle<T>,
    health_server: Option<&HealthServer>,
) where
    T: Transport + 'static,
{
    loop {
        if bridge.is_permanently_disconnected() {
            if let Some(health) = health_server {
                health.set_mqtt_connected(false);
            }
            break;
        }

        if let Some(health) = health_server {
            let connected = bridge.transport().is_some_and(|t| t.is_connected());
            health.set_mqtt_connected(connected);
            health.record_activity_at(metrics().latest_activity());
        }
        sleep(Duration::from_millis(500)).await;
    }
}
