//! Host SDK end-to-end tests against the simulated device daemon.
//!
//! Full loopback: client control channel → device FSM → fragmented frames
//! over real UDP → reassembly → frame stream.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use rayframe_client::{Client, ClientConfig, ImageFormat, save_frame, sidecar_path};
use rayframe_core::DetectorConfig;
use rayframe_device::simulated_device;
use rayframe_proto::{HmacKey, payloads::ScanMode};
use tokio::sync::{oneshot, watch};

const KEY_HEX: &str = "6b65792d756e6465722d74657374"; // "key-under-test"

fn test_key() -> HmacKey {
    HmacKey::new(hex::decode(KEY_HEX).expect("valid hex"))
}

fn next_ports() -> (u16, u16) {
    static NEXT: AtomicU16 = AtomicU16::new(0);
    let offset = NEXT.fetch_add(2, Ordering::Relaxed);
    let base = 52000 + (std::process::id() % 500) as u16 * 20 + offset;
    (base, base + 1)
}

/// Launch a simulated device and a connected client sharing one config.
async fn launch() -> (Client, watch::Sender<bool>) {
    let (data_port, control_port) = next_ports();
    let config = DetectorConfig {
        width: 128,
        height: 128,
        fps: 30,
        data_port,
        control_port,
        hmac_key: Some(KEY_HEX.to_string()),
        ..Default::default()
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (ready_tx, ready_rx) = oneshot::channel();
    let device = simulated_device(config.clone(), test_key());
    tokio::spawn(async move {
        device.run(shutdown_rx, Some(ready_tx)).await.expect("device runs");
    });
    let bound = ready_rx.await.expect("device ready");

    let device_addr = format!("127.0.0.1:{}", bound.port()).parse().expect("addr");
    let client = Client::connect(ClientConfig::new(device_addr, config, test_key()))
        .await
        .expect("client connects");

    (client, shutdown_tx)
}

#[tokio::test]
async fn single_scan_delivers_counter_pattern_frame() {
    let (mut client, shutdown) = launch().await;

    client.start_scan(ScanMode::Single).await.expect("start accepted");

    let mut frames = client.frames();
    let frame = frames
        .next_frame(Duration::from_secs(5))
        .await
        .expect("frame arrives");

    assert_eq!(frame.width, 128);
    assert_eq!(frame.height, 128);
    assert!(!frame.degraded);
    for (i, &pixel) in frame.pixels().iter().enumerate() {
        assert_eq!(pixel, (i % 65536) as u16, "pixel {i} mismatch");
    }

    // Local pipeline accounting: one received, one consumed, none dropped.
    let counters = client.counters();
    assert_eq!(counters.frames_received, 1);
    assert_eq!(counters.frames_sent, 1);
    assert_eq!(counters.frames_dropped, 0);
    assert_eq!(counters.crc_errors, 0);

    // Remote accounting agrees.
    let status = client.refresh_status().await.expect("status");
    assert_eq!(status.counters.frames_sent, 1);
    assert_eq!(status.counters.frames_dropped, 0);

    client.disconnect().await;
    let _ = shutdown.send(true);
}

#[tokio::test]
async fn continuous_scan_streams_until_stop() {
    let (mut client, shutdown) = launch().await;

    client.start_scan(ScanMode::Continuous).await.expect("start accepted");

    let mut frames = client.frames();
    let mut sequences = Vec::new();
    for _ in 0..3 {
        let frame = frames
            .next_frame(Duration::from_secs(5))
            .await
            .expect("frame arrives");
        sequences.push(frame.sequence);
    }
    assert!(sequences.windows(2).all(|w| w[1] > w[0]), "sequences ascend: {sequences:?}");

    client.stop_scan().await.expect("stop accepted");

    // After a stop the stream goes quiet (drain whatever was in flight).
    while frames.next_frame(Duration::from_millis(300)).await.is_some() {}
    assert!(frames.next_frame(Duration::from_millis(300)).await.is_none());

    client.disconnect().await;
    let _ = shutdown.send(true);
}

#[tokio::test]
async fn cold_config_rejected_during_scan_applies_when_idle() {
    let (mut client, shutdown) = launch().await;

    client.start_scan(ScanMode::Continuous).await.expect("start accepted");
    // Make sure the scan is actually active before poking configuration.
    let mut frames = client.frames();
    frames.next_frame(Duration::from_secs(5)).await.expect("scan running");

    let err = client.set_config("bit_depth", "14").await.expect_err("cold key while scanning");
    assert!(matches!(err, rayframe_client::ClientError::Busy(_)), "got {err:?}");

    // Hot keys go through mid-scan.
    client.set_config("fps", "25").await.expect("hot key applies");

    client.stop_scan().await.expect("stop accepted");
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.set_config("bit_depth", "14").await.expect("cold key when idle");

    client.disconnect().await;
    let _ = shutdown.send(true);
}

#[tokio::test]
async fn saved_outputs_match_received_frame() {
    let (mut client, shutdown) = launch().await;
    let dir = tempfile::tempdir().expect("tempdir");

    client.start_scan(ScanMode::Single).await.expect("start accepted");
    let mut frames = client.frames();
    let frame = frames
        .next_frame(Duration::from_secs(5))
        .await
        .expect("frame arrives");

    let raw_path = dir.path().join("scan.raw");
    save_frame(&frame, &raw_path, ImageFormat::Raw).expect("raw saves");
    assert_eq!(std::fs::read(&raw_path).expect("raw"), frame.to_le_bytes());
    assert!(sidecar_path(&raw_path).exists());

    let tiff_path = dir.path().join("scan.tif");
    save_frame(&frame, &tiff_path, ImageFormat::Tiff).expect("tiff saves");
    let tiff = std::fs::read(&tiff_path).expect("tiff");
    assert_eq!(&tiff[0..2], b"II");
    assert!(tiff.len() > frame.len() * 2, "pixel data present");

    client.disconnect().await;
    let _ = shutdown.send(true);
}

#[tokio::test]
async fn wrong_key_commands_are_silently_dropped() {
    let (data_port, control_port) = next_ports();
    let config = DetectorConfig {
        width: 128,
        height: 128,
        data_port,
        control_port,
        hmac_key: Some(KEY_HEX.to_string()),
        ..Default::default()
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (ready_tx, ready_rx) = oneshot::channel();
    let device = simulated_device(config.clone(), test_key());
    tokio::spawn(async move {
        device.run(shutdown_rx, Some(ready_tx)).await.expect("device runs");
    });
    let bound = ready_rx.await.expect("device ready");
    let device_addr = format!("127.0.0.1:{}", bound.port()).parse().expect("addr");

    let wrong_key = HmacKey::new(b"not-the-right-key".to_vec());
    let mut params = ClientConfig::new(device_addr, config, wrong_key);
    params.response_timeout = Duration::from_millis(300);
    let mut client = Client::connect(params).await.expect("client connects");

    let err = client.start_scan(ScanMode::Single).await.expect_err("must not be accepted");
    assert!(
        matches!(err, rayframe_client::ClientError::Timeout(_)),
        "bad-key commands die silently: {err:?}"
    );

    client.disconnect().await;
    let _ = shutdown_tx.send(true);
}
