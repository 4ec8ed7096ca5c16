//! `rayctl` — command-line control for rayframe detectors.
//!
//! ```bash
//! rayctl --device 192.168.1.50:8001 scan --single --output ./frames
//! rayctl status
//! rayctl set fps=30
//! rayctl discover
//! ```
//!
//! Exit codes: 0 success, 1 configuration error, 2 runtime error, 3
//! authentication error.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rayframe_client::{Client, ClientConfig, ClientError, ImageFormat, save_frame};
use rayframe_core::DetectorConfig;
use rayframe_proto::{
    CommandId, HmacKey, ResponseStatus, decode_response, encode_command,
    payloads::{ScanMode, StatusBody, decode_body},
};
use tracing_subscriber::EnvFilter;

const EXIT_CONFIG: u8 = 1;
const EXIT_RUNTIME: u8 = 2;
const EXIT_AUTH: u8 = 3;

/// Rayframe detector control
#[derive(Parser, Debug)]
#[command(name = "rayctl")]
#[command(about = "Control a rayframe detector over its UDP control channel")]
#[command(version)]
struct Args {
    /// Device control endpoint
    #[arg(short, long, default_value = "127.0.0.1:8001")]
    device: SocketAddr,

    /// Path to the YAML configuration (falls back to $DETECTOR_CONFIG)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a scan and pull frames
    Scan {
        /// One frame, then stop (default)
        #[arg(long, conflicts_with_all = ["continuous", "calibration"])]
        single: bool,
        /// Stream until --frames are collected
        #[arg(long, conflicts_with = "calibration")]
        continuous: bool,
        /// One calibration frame against the selected tier
        #[arg(long)]
        calibration: bool,
        /// Calibration/gain tier
        #[arg(long, default_value_t = 0)]
        tier: u8,
        /// Frames to collect in continuous mode
        #[arg(long, default_value_t = 10)]
        frames: u32,
        /// Directory to save frames into (skips saving when absent)
        #[arg(long)]
        output: Option<PathBuf>,
        /// Output format: raw or tiff
        #[arg(long, default_value = "tiff")]
        format: String,
    },
    /// Query detector status and counters
    Status,
    /// Apply one configuration key, e.g. `set fps=30`
    Set {
        /// key=value pair
        pair: String,
    },
    /// Probe the local network for detectors
    Discover,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("rayctl: {message}");
            return ExitCode::from(EXIT_CONFIG);
        },
    };

    let key = match load_key(&config) {
        Ok(key) => key,
        Err(message) => {
            eprintln!("rayctl: {message}");
            return ExitCode::from(EXIT_CONFIG);
        },
    };

    let result = match args.command {
        Command::Scan { single, continuous, calibration, tier, frames, output, format } => {
            let mode = if calibration {
                ScanMode::Calibration
            } else if continuous {
                ScanMode::Continuous
            } else {
                let _ = single;
                ScanMode::Single
            };
            let format = match format.as_str() {
                "raw" => ImageFormat::Raw,
                "tiff" => ImageFormat::Tiff,
                other => {
                    eprintln!("rayctl: unknown format '{other}' (raw|tiff)");
                    return ExitCode::from(EXIT_CONFIG);
                },
            };
            run_scan(args.device, config, key, mode, tier, frames, output, format).await
        },
        Command::Status => run_status(args.device, config, key).await,
        Command::Set { pair } => run_set(args.device, config, key, &pair).await,
        Command::Discover => run_discover(config, key).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("rayctl: {err}");
            ExitCode::from(exit_code_for(&err))
        },
    }
}

fn exit_code_for(err: &ClientError) -> u8 {
    match err {
        ClientError::Auth => EXIT_AUTH,
        ClientError::Rejected(_) => EXIT_CONFIG,
        _ => EXIT_RUNTIME,
    }
}

fn load_config(path: Option<&str>) -> Result<DetectorConfig, String> {
    let path = path.map(String::from).or_else(|| std::env::var("DETECTOR_CONFIG").ok());
    match path {
        Some(path) => DetectorConfig::load(&path).map_err(|e| e.to_string()),
        None => Ok(DetectorConfig::default()),
    }
}

fn load_key(config: &DetectorConfig) -> Result<HmacKey, String> {
    let hex_key = match std::env::var("DETECTOR_HMAC_KEY") {
        Ok(value) => value,
        Err(_) => config
            .hmac_key
            .clone()
            .ok_or_else(|| "no hmac key in config or DETECTOR_HMAC_KEY".to_string())?,
    };
    let bytes = hex::decode(hex_key.trim()).map_err(|e| format!("hmac key is not hex: {e}"))?;
    Ok(HmacKey::new(bytes))
}

#[allow(clippy::too_many_arguments)]
async fn run_scan(
    device: SocketAddr,
    config: DetectorConfig,
    key: HmacKey,
    mode: ScanMode,
    tier: u8,
    frames: u32,
    output: Option<PathBuf>,
    format: ImageFormat,
) -> Result<(), ClientError> {
    let frame_timeout = config.frame_period() * 4 + Duration::from_secs(2);
    let target = match mode {
        ScanMode::Single | ScanMode::Calibration => 1,
        ScanMode::Continuous => frames.max(1),
    };

    if let Some(dir) = &output {
        std::fs::create_dir_all(dir)
            .map_err(|e| ClientError::Output(format!("creating {}: {e}", dir.display())))?;
    }

    let mut client = Client::connect(ClientConfig::new(device, config, key)).await?;
    client.start_scan_tiered(mode, tier).await?;

    let mut stream = client.frames();
    let mut collected = 0u32;
    while collected < target {
        let Some(frame) = stream.next_frame(frame_timeout).await else {
            eprintln!("rayctl: no frame within {frame_timeout:?}");
            break;
        };

        println!(
            "frame {:>6}  {}x{}  t={}us{}",
            frame.sequence,
            frame.width,
            frame.height,
            frame.timestamp_us,
            if frame.degraded { "  [degraded]" } else { "" }
        );

        if let Some(dir) = &output {
            let extension = match format {
                ImageFormat::Raw => "raw",
                ImageFormat::Tiff => "tif",
            };
            let path = dir.join(format!("frame_{:06}.{extension}", frame.sequence));
            save_frame(&frame, &path, format)?;
        }
        collected += 1;
    }

    if mode == ScanMode::Continuous {
        client.stop_scan().await?;
    }

    let counters = client.counters();
    println!(
        "collected {collected} frame(s); received={} dropped={} crc_errors={}",
        counters.frames_received, counters.frames_dropped, counters.crc_errors
    );
    client.disconnect().await;
    Ok(())
}

async fn run_status(
    device: SocketAddr,
    config: DetectorConfig,
    key: HmacKey,
) -> Result<(), ClientError> {
    let mut client = Client::connect(ClientConfig::new(device, config, key)).await?;
    let status = client.refresh_status().await?;
    print_status(&device.to_string(), &status);
    client.disconnect().await;
    Ok(())
}

fn print_status(origin: &str, status: &StatusBody) {
    println!("{origin}: phase={:?} mode={:?}", status.phase, status.active_mode);
    println!(
        "  link_up={} device_fault={}",
        status.health.link_up, status.health.device_fault
    );
    let c = &status.counters;
    println!(
        "  received={} sent={} dropped={} auth_failures={} crc_errors={} reassembly_timeouts={}",
        c.frames_received,
        c.frames_sent,
        c.frames_dropped,
        c.auth_failures,
        c.crc_errors,
        c.reassembly_timeouts
    );
}

async fn run_set(
    device: SocketAddr,
    config: DetectorConfig,
    key: HmacKey,
    pair: &str,
) -> Result<(), ClientError> {
    let Some((config_key, value)) = pair.split_once('=') else {
        return Err(ClientError::Rejected(format!("expected key=value, got '{pair}'")));
    };

    let mut client = Client::connect(ClientConfig::new(device, config, key)).await?;
    client.set_config(config_key.trim(), value.trim()).await?;
    println!("{config_key} = {value}");
    client.disconnect().await;
    Ok(())
}

/// Broadcast a GET_STATUS probe and list every detector that answers.
async fn run_discover(config: DetectorConfig, key: HmacKey) -> Result<(), ClientError> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;

    let wire = encode_command(1, CommandId::GetStatus, &[], &key)
        .map_err(|e| ClientError::Protocol(e.to_string()))?;
    socket
        .send_to(&wire, ("255.255.255.255", config.control_port))
        .await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    let mut buf = vec![0u8; 65536];
    let mut found = 0u32;

    while let Ok(Ok((len, source))) =
        tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await
    {
        let Ok(response) = decode_response(&buf[..len], &key) else { continue };
        if response.status() != Some(ResponseStatus::Ok) {
            continue;
        }
        let Ok(status) = decode_body::<StatusBody>(&response.payload) else { continue };
        print_status(&source.to_string(), &status);
        found += 1;
    }

    if found == 0 {
        println!("no detectors answered on port {}", config.control_port);
    }
    Ok(())
}
