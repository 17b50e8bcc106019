mod single_instance;

use airbridge_bridge::{
    AirPlayScanner, ConfigStore, DeviceManager, DeviceManagerConfig, DlnaConfig, DlnaService,
    EventBus, OutputConfig, ScannerConfig,
};
use airbridge_core::{Event, EventKind};
use anyhow::{Context, Result};
use clap::Parser;
use single_instance::SingleInstanceGuard;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// AirPlay-to-DLNA bridge: turns every AirPlay receiver on the LAN (plus,
/// optionally, this machine's own speaker) into a DLNA media renderer.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port the DLNA HTTP router (device descriptions, SOAP, GENA) listens on.
    #[arg(long, env = "AIRBRIDGE_HTTP_PORT", default_value_t = 8200)]
    http_port: u16,

    /// UDP port SSDP multicast NOTIFY/M-SEARCH uses.
    #[arg(long, env = "AIRBRIDGE_SSDP_PORT", default_value_t = 1900)]
    ssdp_port: u16,

    /// LAN-facing IP advertised in SSDP LOCATION/USN headers. Defaults to
    /// the address the OS routing table picks for the default route.
    #[arg(long, env = "AIRBRIDGE_BIND_IP")]
    bind_ip: Option<IpAddr>,

    /// Output sample rate in Hz for every virtual device's audio pipeline.
    #[arg(long, env = "AIRBRIDGE_SAMPLE_RATE", default_value_t = 44100)]
    sample_rate: u32,

    /// Directory used to cache downloaded media before decoding.
    #[arg(long, env = "AIRBRIDGE_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Path to the persisted per-device config (DSP settings, etc.).
    #[arg(long, env = "AIRBRIDGE_CONFIG_PATH")]
    config_path: Option<PathBuf>,

    /// Expose this machine's own audio output as an additional virtual device.
    #[arg(long, env = "AIRBRIDGE_ENABLE_SERVER_SPEAKER", default_value_t = false)]
    enable_server_speaker: bool,

    /// Seconds between AirPlay discovery rounds.
    #[arg(long, env = "AIRBRIDGE_SCAN_INTERVAL_SECS", default_value_t = 30)]
    scan_interval_secs: u64,

    /// Consecutive missed scan rounds before a device is declared offline.
    #[arg(long, env = "AIRBRIDGE_OFFLINE_THRESHOLD", default_value_t = 3)]
    offline_threshold: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let _instance_guard = match SingleInstanceGuard::acquire("airbridge-daemon") {
        Ok(guard) => guard,
        Err(e) => {
            tracing::error!(error = %e, "another instance is already running");
            std::process::exit(1);
        }
    };

    let config_path = args.config_path.unwrap_or_else(default_config_path);
    let cache_dir = args.cache_dir.unwrap_or_else(default_cache_dir);
    std::fs::create_dir_all(&cache_dir)
        .with_context(|| format!("creating cache dir {}", cache_dir.display()))?;
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating config dir {}", parent.display()))?;
    }

    tracing::info!(
        http_port = args.http_port,
        ssdp_port = args.ssdp_port,
        ?cache_dir,
        ?config_path,
        "starting airbridge"
    );

    let event_bus = Arc::new(EventBus::new());
    let config_store = ConfigStore::load(config_path).await;

    let device_manager = DeviceManager::new(
        DeviceManagerConfig {
            enable_server_speaker: args.enable_server_speaker,
            cache_dir,
            output_config: OutputConfig {
                sample_rate: args.sample_rate,
                ..OutputConfig::default()
            },
        },
        event_bus.clone(),
        config_store,
    );

    let scanner = AirPlayScanner::new(ScannerConfig {
        scan_interval: Duration::from_secs(args.scan_interval_secs),
        offline_threshold: args.offline_threshold,
        ..ScannerConfig::default()
    });

    device_manager.bootstrap(&scanner).await;
    scanner.start().await;

    let dlna = DlnaService::new(
        device_manager.clone(),
        event_bus.clone(),
        DlnaConfig {
            http_port: args.http_port,
            ssdp_port: args.ssdp_port,
            bind_ip: args.bind_ip,
        },
    );
    dlna.start().await;

    event_bus.publish(Event::global(EventKind::Startup));
    tracing::info!("airbridge running, press ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!("shutdown signal received");
    event_bus.publish(Event::global(EventKind::Shutdown));

    dlna.stop().await;
    scanner.stop().await;
    device_manager.shutdown().await;

    tracing::info!("airbridge stopped");
    Ok(())
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("airbridge")
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("airbridge")
        .join("config.json")
}
