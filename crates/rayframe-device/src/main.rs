//! Rayframe device daemon.
//!
//! # Usage
//!
//! ```bash
//! # Simulated detector, configuration from file
//! rayframe-device --config detector.yaml --simulate
//!
//! # Fixed frame destination instead of deriving it from the START source
//! rayframe-device --simulate --dest 192.168.1.20:8000
//! ```
//!
//! `DETECTOR_CONFIG` supplies the configuration path when `--config` is
//! absent; `DETECTOR_HMAC_KEY` overrides the file's key;
//! `DETECTOR_LOG_LEVEL` overrides the file's log level.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;
use rayframe_core::DetectorConfig;
use rayframe_device::{DeviceError, load_key, simulated_device};
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Rayframe detector daemon
#[derive(Parser, Debug)]
#[command(name = "rayframe-device")]
#[command(about = "X-ray detector streaming daemon")]
#[command(version)]
struct Args {
    /// Path to the YAML configuration (falls back to $DETECTOR_CONFIG)
    #[arg(short, long)]
    config: Option<String>,

    /// Run against the in-process simulated detector
    #[arg(long)]
    simulate: bool,

    /// Fixed frame destination (default: derived from the START source)
    #[arg(long)]
    dest: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("rayframe-device: {err}");
            return ExitCode::from(1);
        },
    };

    let level = std::env::var("DETECTOR_LOG_LEVEL")
        .unwrap_or_else(|_| config.log_level.as_filter_str().to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("rayframe device starting");

    let key = match load_key(&config) {
        Ok(key) => key,
        Err(err) => {
            tracing::error!("{err}");
            return ExitCode::from(1);
        },
    };

    if !args.simulate {
        tracing::error!("no hardware backend in this build; run with --simulate");
        return ExitCode::from(2);
    }

    let mut device = simulated_device(config, key);
    if let Some(dest) = args.dest {
        device = device.with_data_dest(dest);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    match device.run(shutdown_rx, None).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(DeviceError::Config(err)) => {
            tracing::error!("configuration error: {err}");
            ExitCode::from(1)
        },
        Err(err) => {
            tracing::error!("runtime error: {err}");
            ExitCode::from(2)
        },
    }
}

fn load_config(path: Option<&str>) -> Result<DetectorConfig, DeviceError> {
    let path = path.map(String::from).or_else(|| std::env::var("DETECTOR_CONFIG").ok());
    match path {
        Some(path) => Ok(DetectorConfig::load(path)?),
        None => Ok(DetectorConfig::default()),
    }
}
