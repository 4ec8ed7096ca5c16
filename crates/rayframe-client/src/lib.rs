//! Host SDK for the rayframe detector link.
//!
//! The egress half of the pipeline: receive fragmented frame packets over
//! UDP, reassemble them under loss and reordering, and hand completed frames
//! to the application through a lazy stream. A thin authenticated control
//! client drives the detector (start/stop/status/configuration), and frames
//! can be persisted as RAW-plus-sidecar or TIFF.
//!
//! ```no_run
//! use rayframe_client::{Client, ClientConfig, ImageFormat, save_frame};
//! use rayframe_core::DetectorConfig;
//! use rayframe_proto::{HmacKey, payloads::ScanMode};
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), rayframe_client::ClientError> {
//! let key = HmacKey::new(b"secret".to_vec());
//! let params = ClientConfig::new(
//!     "192.168.1.50:8001".parse().expect("addr"),
//!     DetectorConfig::default(),
//!     key,
//! );
//!
//! let mut client = Client::connect(params).await?;
//! client.start_scan(ScanMode::Single).await?;
//!
//! let mut frames = client.frames();
//! if let Some(frame) = frames.next_frame(Duration::from_secs(5)).await {
//!     save_frame(&frame, "frame.tif", ImageFormat::Tiff)?;
//! }
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

mod client;
mod error;
mod output;
mod receiver;

pub use client::{Client, ClientConfig, DEFAULT_RESPONSE_TIMEOUT, FrameStream};
pub use error::ClientError;
pub use output::{ImageFormat, SidecarManifest, save_frame, sidecar_path};
pub use receiver::INTAKE_CAPACITY;
