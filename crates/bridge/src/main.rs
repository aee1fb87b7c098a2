//! usb-ws-bridge
//!
//! Bridges a USB virtual-serial peripheral to WebSocket subscribers and
//! serves the boot image / content store upload endpoints.

use anyhow::{Context, Result};
use bridge::config::{BridgeConfig, SinkKind};
use bridge::http::bind_with_retry;
use bridge::indicator::{IndicatorSink, LogSink, SysfsLedSink};
use bridge::restart::ProcessRestarter;
use bridge::service;
use bridge::storage::StorageTargets;
use bridge::usb::UsbSerialOpener;
use bridge::Bridge;
use clap::Parser;
use common::setup_logging;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-ws-bridge")]
#[command(
    author,
    version,
    about = "USB serial to WebSocket bridge"
)]
#[command(long_about = "
Relays a USB virtual-serial peripheral (CDC-ACM or CP210x) to any number of
WebSocket subscribers, and accepts authenticated boot image and content store
replacement over HTTP.

EXAMPLES:
    # Run with default config
    usb-ws-bridge

    # Run with custom config
    usb-ws-bridge --config /path/to/bridge.toml

    # List serial-capable USB devices without starting the bridge
    usb-ws-bridge --list-devices

    # Run with debug logging
    usb-ws-bridge --log-level debug

CONFIGURATION:
    The bridge looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-ws-bridge/bridge.toml
    3. /etc/usb-ws-bridge/bridge.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List serial-capable USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = BridgeConfig::default();
        let path = BridgeConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config =
        BridgeConfig::load_or_default(args.config.clone()).context("Failed to load configuration")?;

    // CLI log level wins over the config file
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.server.log_level);

    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-ws-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let opener = UsbSerialOpener::new(&config.usb.filters).context("Failed to initialise libusb")?;

    if args.list_devices {
        return list_devices_mode(&opener);
    }

    run(config, opener).await
}

/// List serial-capable devices and exit
fn list_devices_mode(opener: &UsbSerialOpener) -> Result<()> {
    let devices = opener.list().context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No serial-capable USB devices found.");
        return Ok(());
    }

    println!("Found {} serial-capable device(s):\n", devices.len());
    for device in devices {
        println!(
            "  {:04x}:{:04x} - {}",
            device.vendor_id,
            device.product_id,
            device.product.as_deref().unwrap_or("Unknown Product")
        );
        println!(
            "      Bus {:03} Device {:03} {:?} (interface {}, endpoints {:#04x}/{:#04x})",
            device.bus_number,
            device.address,
            device.layout.kind,
            device.layout.data_interface,
            device.layout.endpoint_in,
            device.layout.endpoint_out
        );
        println!();
    }
    Ok(())
}

fn indicator_sink(config: &BridgeConfig) -> Box<dyn IndicatorSink> {
    match config.indicator.sink {
        SinkKind::Log => Box::new(LogSink::default()),
        SinkKind::Sysfs => {
            match SysfsLedSink::open(Path::new(SysfsLedSink::LEDS_ROOT), &config.indicator.led_name)
            {
                Ok(sink) => Box::new(sink),
                Err(e) => {
                    warn!(
                        "Indicator LED '{}' unavailable ({}), logging colours instead",
                        config.indicator.led_name, e
                    );
                    Box::new(LogSink::default())
                }
            }
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal as unix_signal};
        match unix_signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    result = signal::ctrl_c() => {
                        if let Err(e) = result {
                            error!("Error waiting for Ctrl+C: {}", e);
                        }
                        info!("Received Ctrl+C, shutting down gracefully...");
                    }
                    _ = term.recv() => info!("Received SIGTERM, shutting down gracefully..."),
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
        Err(e) => error!("Error waiting for Ctrl+C: {}", e),
    }
}

async fn run(config: BridgeConfig, opener: UsbSerialOpener) -> Result<()> {
    if service::is_systemd() {
        info!("Running under systemd");
    }

    let targets = StorageTargets::from_settings(&config.storage)
        .context("Failed to resolve storage paths")?;
    let bridge = Bridge::start(
        &config,
        opener,
        targets,
        Arc::new(ProcessRestarter::new()),
        indicator_sink(&config),
    )?;

    let listener = bind_with_retry(
        &config.server.bind_addr,
        Duration::from_millis(config.server.bind_retry_ms),
        bridge.indicator(),
        &bridge.state().hub,
    )
    .await;

    let watchdog_handle = service::spawn_watchdog_task();

    service::notify_ready().context("Failed to notify systemd ready")?;
    service::notify_status(&format!("Serving on {}", config.server.bind_addr))
        .context("Failed to send status to systemd")?;

    info!("Press Ctrl+C to shutdown");

    let result = bridge.serve(listener, shutdown_signal()).await;
    if let Err(e) = &result {
        error!("Server error: {:#}", e);
    }

    service::notify_stopping().context("Failed to notify systemd stopping")?;

    if let Some(handle) = watchdog_handle {
        handle.abort();
    }

    info!("Shutting down USB session...");
    if let Err(e) = bridge.shutdown().await {
        error!("Error shutting down bridge: {:#}", e);
    }

    info!("Bridge shutdown complete");
    result
}
