//! devtunnel - local development bridge and private network tunnel
//!
//! This is the main entry point for the devtunnel application.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use devtunnel::bridge::{BridgeChannels, DevBridge};
use devtunnel::config::{load_config, Config};
use devtunnel::error::{DevTunnelError, TunnelError};
use devtunnel::host::ExecutionHost;
use devtunnel::ssh::SshConnector;
use devtunnel::transport::{ApiKeySigner, PubSub, TransportClient};
use devtunnel::tunnel::{InstallOutcome, NetworkDriver, SystemRunner, TunOpener, TunnelController, TunnelState};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Environment variable overriding `transport.api_key`
const API_KEY_ENV: &str = "DEVTUNNEL_API_KEY";

/// devtunnel - run serverless handlers locally and reach private networks
#[derive(Parser, Debug)]
#[command(name = "devtunnel")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "devtunnel.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage the network tunnel
    Tunnel {
        #[command(subcommand)]
        action: TunnelAction,
    },
    /// Serve live invocations for a stage until interrupted
    Dev {
        /// Stage name (defaults to `default_stage`)
        stage: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum TunnelAction {
    /// Create the tunnel device (requires root / administrator)
    Install,
    /// Route the stage's networks through its bastion until interrupted
    Start {
        /// Stage name (defaults to `default_stage`)
        stage: Option<String>,
    },
    /// Remove routes and the tunnel device
    Destroy,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = setup_logging(&args.log_level, args.json_log) {
        eprintln!("Failed to set up logging: {:#}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        std::process::exit(exit_code(&e));
    }
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(&args.config)?;

    info!("devtunnel v{}", devtunnel::VERSION);
    info!("Configuration loaded from: {:?}", args.config);

    match args.command {
        Command::Tunnel { action } => run_tunnel(&config, action).await,
        Command::Dev { stage } => run_dev(&config, stage.as_deref()).await,
    }
}

/// Map an error chain to the process exit code
fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| {
            cause
                .downcast_ref::<TunnelError>()
                .or_else(|| match cause.downcast_ref::<DevTunnelError>() {
                    Some(DevTunnelError::Tunnel(e)) => Some(e),
                    _ => None,
                })
        })
        .map_or(1, TunnelError::exit_code)
}

fn tunnel_controller(config: &Config) -> Result<TunnelController> {
    let driver = NetworkDriver::for_host(&config.tunnel, Arc::new(SystemRunner))?;
    Ok(TunnelController::new(
        config.tunnel.clone(),
        driver,
        Arc::new(TunOpener),
        Arc::new(SshConnector),
    ))
}

async fn run_tunnel(config: &Config, action: TunnelAction) -> Result<()> {
    let mut controller = tunnel_controller(config)?;

    match action {
        TunnelAction::Install => {
            match controller.install().await? {
                InstallOutcome::Created => info!("Tunnel device {} installed", config.tunnel.device),
                InstallOutcome::AlreadyPresent => {
                    info!("Tunnel device {} is already installed", config.tunnel.device)
                }
            }
            Ok(())
        }
        TunnelAction::Destroy => {
            controller.discover().await?;
            controller.destroy().await?;
            Ok(())
        }
        TunnelAction::Start { stage } => {
            let (name, stage) = config.stage(stage.as_deref()).map_err(|e| anyhow!(e))?;
            let bastion = stage
                .bastion
                .as_ref()
                .ok_or_else(|| anyhow!("stage '{}' has no bastion configured", name))?;
            if stage.routes.is_empty() {
                warn!("Stage '{}' routes no networks", name);
            }

            if controller.discover().await? == TunnelState::Uninstalled {
                info!("Tunnel device not found, installing");
                controller.install().await?;
            }
            controller
                .start(&stage.routes, bastion)
                .await
                .with_context(|| format!("Failed to start tunnel for stage '{}'", name))?;

            let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
            spawn_signal_handler(shutdown_tx);
            info!("Tunnel running for stage '{}', press Ctrl+C to stop", name);
            let _ = shutdown_rx.recv().await;

            controller.stop().await?;
            Ok(())
        }
    }
}

async fn run_dev(config: &Config, stage: Option<&str>) -> Result<()> {
    let (name, _) = config.stage(stage).map_err(|e| anyhow!(e))?;
    let mut transport = config
        .transport
        .clone()
        .ok_or_else(|| anyhow!("No [transport] section in the configuration"))?;
    if let Ok(key) = std::env::var(API_KEY_ENV) {
        transport.api_key = Some(key);
    }
    let api_key = transport
        .api_key
        .clone()
        .ok_or_else(|| anyhow!("No API key: set transport.api_key or {}", API_KEY_ENV))?;

    let channels = BridgeChannels::new(&transport.namespace, &config.channel_base(name));
    info!("Connecting to {}", transport.endpoint);
    let (client, inbound) = TransportClient::connect(transport, Arc::new(ApiKeySigner::new(api_key)))
        .await
        .context("Failed to connect to the pub/sub endpoint")?;
    let client = Arc::new(client);

    let host = ExecutionHost::from_config(config, name);
    let bridge = DevBridge::new(client.clone(), host, channels, &config.bridge);
    bridge.start().await?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    spawn_signal_handler(shutdown_tx);
    info!("Serving stage '{}', press Ctrl+C to stop", name);
    bridge.run(inbound, shutdown_rx).await;

    if let Err(e) = client.close().await {
        warn!("Transport close failed: {}", e);
    }
    Ok(())
}

/// Send on `shutdown_tx` at Ctrl+C or SIGTERM
fn spawn_signal_handler(shutdown_tx: broadcast::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {
                            info!("Received Ctrl+C, shutting down...");
                        }
                        _ = sigterm.recv() => {
                            info!("Received SIGTERM, shutting down...");
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to set up SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received Ctrl+C, shutting down...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            // On Windows, only handle Ctrl+C
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down...");
        }

        let _ = shutdown_tx.send(true);
    });
}

/// Setup logging; `RUST_LOG` takes precedence over `level`
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
