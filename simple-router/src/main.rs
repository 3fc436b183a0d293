//! simple-router: controller for the P4 simple router.
//!
//! Connects to the switch, assigns the device, installs the default and
//! static entries, then serves packet-ins until interrupted. SIGHUP reloads
//! the configuration file through a three-phase replace.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use simple_router::config::{
    DEFAULT_CPU_IFACE, DEFAULT_GRPC_ADDR, DEFAULT_NOTIFICATIONS, DEFAULT_THRIFT_PORT,
};
use simple_router::{Controller, ControllerConfig, DeviceDescription, DeviceExtras};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// P4 simple router controller
#[derive(Parser, Debug)]
#[command(name = "simple-router", version, about)]
struct Args {
    /// Switch gRPC endpoint
    #[arg(long, default_value = DEFAULT_GRPC_ADDR)]
    grpc_addr: String,

    /// Device id on the switch
    #[arg(long, default_value_t = 0)]
    device_id: i32,

    /// bmv2 JSON of the program to load
    #[arg(long)]
    config: PathBuf,

    /// Thrift port of the switch
    #[arg(long, default_value_t = DEFAULT_THRIFT_PORT)]
    thrift_port: u16,

    /// Notifications socket address
    #[arg(long, default_value = DEFAULT_NOTIFICATIONS)]
    notifications: String,

    /// Interface used as the switch's CPU port
    #[arg(long, default_value = DEFAULT_CPU_IFACE)]
    cpu_iface: String,

    /// Do not install the static routes and interfaces
    #[arg(long)]
    skip_static: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "simple_router=info,tonic=warn,tower=warn,hyper=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let description = DeviceDescription::from_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    let config = ControllerConfig::default()
        .with_grpc_addr(args.grpc_addr.clone())
        .with_device_id(args.device_id)
        .with_extras(
            DeviceExtras::default()
                .with_thrift_port(args.thrift_port)
                .with_notifications(args.notifications.clone())
                .with_cpu_iface(args.cpu_iface.clone()),
        );

    info!(addr = %config.grpc_addr, device_id = config.device_id, "Starting simple-router");
    let controller = Controller::connect(&config, description)
        .await
        .context("Failed to connect to switch")?;
    let handle = controller.handle();

    handle
        .set_default_entries()
        .await
        .context("Failed to install default entries")?;
    if args.skip_static {
        info!("Skipping static configuration");
    } else {
        handle
            .static_config()
            .await
            .context("Failed to install static configuration")?;
    }

    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    info!("Router ready");
    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!(path = %args.config.display(), "Received SIGHUP, reloading config");
                match tokio::fs::read(&args.config).await {
                    Ok(raw) => match handle.update_config(raw).await {
                        Ok(()) => info!("Config reloaded"),
                        Err(e) => error!(error = %e, "Config reload failed"),
                    },
                    Err(e) => error!(error = %e, "Failed to read config"),
                }
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down");
                break;
            }
        }
    }

    drop(handle);
    controller.shutdown().await;
    Ok(())
}
