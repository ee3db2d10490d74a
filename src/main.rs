use clap::{Parser, Subcommand};
use esp32_ble_link::domain::settings::SettingsService;
use esp32_ble_link::infrastructure::bluetooth::scanner::BleScanner;
use esp32_ble_link::infrastructure::bluetooth::{BluetoothService, BtleplugTransport, SessionConfig};
use esp32_ble_link::infrastructure::logging;
use esp32_ble_link::presentation::console::ConsoleApp;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "esp32-ble-link")]
#[command(about = "Connect to an ESP32 over BLE, mirror its status and drive its actuator")]
struct Cli {
    /// Settings file to use instead of the per-user one
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Advertised name to look for
    #[arg(long, global = true)]
    name: Option<String>,

    /// Scan timeout in milliseconds
    #[arg(long = "timeout-ms", global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive session (default)
    Run,
    /// List nearby peripherals and exit
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings_service = match &cli.config {
        Some(path) => SettingsService::from_path(path),
        None => SettingsService::new()?,
    };

    let _logging_guard = logging::init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    if !settings_service.path().exists() {
        match settings_service.save() {
            Ok(()) => info!("Wrote default settings to {}", settings_service.path().display()),
            Err(e) => warn!("Could not write default settings: {}", e),
        }
    }

    let settings = settings_service.get_mut();
    if let Some(name) = cli.name {
        settings.target_name = name;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        settings.scan_timeout_ms = timeout_ms;
    }
    let config = SessionConfig::from(&*settings);

    info!(target = %config.target_name, "Starting ESP32 BLE link");
    let transport = BtleplugTransport::new().await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(transport, config).await,
        Commands::Scan { duration } => scan(transport, Duration::from_secs(duration)).await,
    }
}

async fn run(transport: BtleplugTransport, config: SessionConfig) -> anyhow::Result<()> {
    let (app_tx, app_rx) = mpsc::unbounded_channel();
    let (service, handle) = BluetoothService::new(transport, config, app_tx.clone());
    let service_task = tokio::spawn(service.run());

    ConsoleApp::new(handle, app_tx, app_rx).run().await?;

    // Dropping the last handle lets the service disconnect and stop
    service_task.await?;
    Ok(())
}

async fn scan(transport: BtleplugTransport, duration: Duration) -> anyhow::Result<()> {
    let devices = BleScanner::new(&transport).survey(duration).await?;
    if devices.is_empty() {
        println!("No peripherals found");
        return Ok(());
    }
    for device in devices {
        let rssi = device
            .rssi
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "?".to_string());
        println!(
            "{:<24} {:<40} {}",
            device.name.as_deref().unwrap_or("(unnamed)"),
            device.id,
            rssi
        );
    }
    Ok(())
}
