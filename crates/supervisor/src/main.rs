//! gps-supervisor
//!
//! Acquires the USB GPS receiver, binds gpsd to it and keeps the binding
//! healthy.

use anyhow::{Context, Result};
use clap::Parser;
use common::{TargetSignature, setup_logging};
use std::path::PathBuf;
use std::process::ExitCode;
use supervisor::acquisition::{AcquisitionController, AcquisitionError};
use supervisor::config::SupervisorConfig;
use supervisor::handoff::HandoffPublisher;
use supervisor::shutdown::{ShutdownSignal, listen_for_termination, shutdown_channel};
use supervisor::usb::{DescriptorResolver, DeviceLocator, SysfsResolver, list_usb_devices};
use supervisor::{GpsdManager, GpsdProbe, Watchdog, service};
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "gps-supervisor")]
#[command(
    author,
    version,
    about = "GPS supervisor - acquire the USB GPS receiver and keep gpsd bound to it"
)]
#[command(long_about = "
Locates the USB GPS receiver by vendor/product id, starts a single gpsd
instance on it, verifies that NMEA sentences flow, and resets the binding
whenever the receiver is attached but silent.

EXAMPLES:
    # Acquire and supervise with default config
    gps-supervisor

    # Acquire once and exit (0 ok, 2 no hardware, 3 bind/verify failed,
    # 5 bound but hand-off file not written)
    gps-supervisor --once

    # Show attached USB devices and candidate serial nodes
    gps-supervisor --list-devices

    # Run with debug logging
    gps-supervisor --log-level debug

CONFIGURATION:
    The supervisor looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/gps-supervisor/supervisor.toml
    3. /etc/gps-supervisor/supervisor.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Acquire once, publish the device and exit
    #[arg(long, conflicts_with = "watch_only")]
    once: bool,

    /// Skip the initial acquisition and only supervise
    #[arg(long)]
    watch_only: bool,

    /// List USB devices and candidate nodes, then exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

type Controller = AcquisitionController<SysfsResolver, GpsdManager, GpsdProbe>;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    if args.save_config {
        let config = SupervisorConfig::default();
        let path = SupervisorConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(ExitCode::SUCCESS);
    }

    let config = if let Some(ref path) = args.config {
        SupervisorConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        SupervisorConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.supervisor.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("gps-supervisor v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let signature = config.signature()?;

    if args.list_devices {
        list_devices_mode(&config, &signature);
        return Ok(ExitCode::SUCCESS);
    }

    let (trigger, shutdown) = shutdown_channel();
    let _signals = listen_for_termination(trigger).context("Failed to install signal handlers")?;

    let mut controller = build_controller(&config);
    info!("Target signature: {}", signature);

    if args.once {
        return Ok(run_once(&mut controller, &signature, &shutdown).await);
    }

    run_supervised(config, controller, &signature, &shutdown, args.watch_only).await
}

fn build_controller(config: &SupervisorConfig) -> Controller {
    let publisher = HandoffPublisher::new(config.handoff.path.clone());
    let first_bind_id = publisher.last_bind_id().map_or(1, |id| id + 1);
    debug!("First bind id: {}", first_bind_id);

    AcquisitionController::new(
        DeviceLocator::from_settings(&config.device),
        GpsdManager::new(config.daemon.clone()).with_first_bind_id(first_bind_id),
        GpsdProbe::new(config.probe.clone()),
        config.acquisition.retry_policy(),
        config.probe.window(),
    )
    .with_handoff(publisher)
}

async fn run_once(
    controller: &mut Controller,
    signature: &TargetSignature,
    shutdown: &ShutdownSignal,
) -> ExitCode {
    match controller.acquire(signature, shutdown).await {
        Ok(handle) => {
            println!("{}", handle.device.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

/// Bootstrap acquisition followed by the watchdog loop
async fn run_supervised(
    config: SupervisorConfig,
    mut controller: Controller,
    signature: &TargetSignature,
    shutdown: &ShutdownSignal,
    watch_only: bool,
) -> Result<ExitCode> {
    let keepalive = service::spawn_keepalive_task();

    let bootstrap = if watch_only {
        info!("Watch-only mode, skipping initial acquisition");
        None
    } else {
        service::report_status(&format!("Searching for {}", signature));
        match controller.acquire(signature, shutdown).await {
            Ok(handle) => Some(handle),
            // The watchdog can still keep the binding healthy
            Err(AcquisitionError::Handoff { handle, reason }) => {
                error!("Acquired {} but hand-off failed: {}", handle, reason);
                Some(handle)
            }
            Err(e) => {
                error!("Initial acquisition failed: {}", e);
                if let Some(task) = keepalive {
                    task.abort();
                }
                return Ok(ExitCode::from(e.exit_code()));
            }
        }
    };

    match &bootstrap {
        Some(handle) => service::report_status(&format!("Active on {}", handle.device.display())),
        None => service::report_status("Supervising"),
    }
    if let Err(e) = service::notify_ready() {
        warn!("Failed to notify systemd: {:#}", e);
    }

    let mut watchdog = Watchdog::new(controller, config.watchdog.clone());
    if let Some(handle) = bootstrap {
        watchdog = watchdog.with_handle(handle);
    }
    watchdog.run(signature, shutdown).await;

    if let Err(e) = service::notify_stopping() {
        warn!("Failed to notify systemd: {:#}", e);
    }
    if let Some(task) = keepalive {
        task.abort();
    }

    info!("Supervisor stopped");
    Ok(ExitCode::SUCCESS)
}

/// List USB devices and candidate nodes, then exit
fn list_devices_mode(config: &SupervisorConfig, signature: &TargetSignature) {
    match list_usb_devices() {
        Ok(devices) if devices.is_empty() => println!("No USB devices found."),
        Ok(devices) => {
            println!("Found {} USB device(s):\n", devices.len());
            for device in devices {
                let marker = if signature.matches(&device.descriptor) {
                    "  <- target"
                } else {
                    ""
                };
                println!(
                    "  {} - {} {}{}",
                    device.descriptor,
                    device
                        .manufacturer
                        .as_deref()
                        .unwrap_or("Unknown Manufacturer"),
                    device.product.as_deref().unwrap_or("Unknown Product"),
                    marker
                );
                println!(
                    "      Bus {:03} Device {:03}",
                    device.bus_number, device.address
                );
            }
        }
        Err(e) => warn!("Cannot enumerate USB devices: {}", e),
    }

    let locator = DeviceLocator::from_settings(&config.device);
    let candidates = locator.candidates();
    println!();
    if candidates.is_empty() {
        println!(
            "No candidate nodes {}{}..={}",
            locator.scan_range().prefix,
            locator.scan_range().first,
            locator.scan_range().last
        );
        return;
    }

    println!("Candidate nodes:\n");
    for candidate in candidates {
        match locator.resolver().resolve(candidate.path()) {
            Some(descriptor) if signature.matches(&descriptor) => {
                println!("  {}  {}  <- target", candidate, descriptor)
            }
            Some(descriptor) => println!("  {}  {}", candidate, descriptor),
            None => println!("  {}  (no USB descriptor)", candidate),
        }
    }
}
