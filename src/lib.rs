//! # DCT Capture Library
//!
//! The capture-session transport core of a network encoder for SageTV: it
//! turns a TV tuner into an exclusively owned recording session and moves the
//! tuner's MPEG transport stream into a local file or the DVR's media server.
//!
//! ## Architecture
//!
//! The library is organized leaf-first:
//! - `core`: stream buffer, transport-stream boundary scanning, RTP port pool
//! - `producer`: threads that read UDP/RTP, HTTP or any `Read` source
//! - `consumer`: the thread that drains the buffer into a file, upload or nothing
//! - `upload`: the media-server line protocol (`WRITEOPEN`, `WRITE`, `REMUX_*`)
//! - `rtsp`: DESCRIBE/SETUP/PLAY/TEARDOWN control of remote tuners
//! - `session`: start/stop coordination of one producer and one consumer
//! - `capture`: the device state machine the DVR talks to
//! - `context`: device registry, pools and shared configuration
//!
//! ## Data Flow
//!
//! ```text
//!  tuner ──RTP/HTTP/pipe──▶ Producer ──write──▶ StreamBuffer ──▶ Consumer ──▶ file
//!    ▲                                                              │
//!    └──── RTSP SETUP/PLAY ◀── CaptureDeviceSession                 └──▶ UploadSession ──▶ SageTV
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dct_capture::capture::{DeviceIdentity, DeviceSource, PassthroughTuner};
//! use dct_capture::config::DctConfig;
//! use dct_capture::consumer::SinkTarget;
//! use dct_capture::context::CaptureContext;
//!
//! let context = CaptureContext::new(DctConfig::default());
//! let device = context.create_device(
//!     DeviceIdentity::standalone("DCT-Tuner 0", 1),
//!     Arc::new(PassthroughTuner),
//!     DeviceSource::Http { urls: vec!["http://192.168.1.40/stream".parse().unwrap()] },
//! );
//!
//! assert!(device.set_locked(true));
//! let target = SinkTarget::File { path: "recording.ts".into() };
//! if device.start_encoding("2-1", target, "Great", 0) {
//!     println!("{} bytes so far", device.recorded_bytes());
//! }
//! device.stop_device();
//! ```

pub mod capture;
pub mod config;
pub mod consumer;
pub mod context;
pub mod core;
pub mod error;
pub mod producer;
pub mod rtsp;
pub mod session;
pub mod upload;

/// Re-export error types for convenience
pub use error::{DctError, DctResult, Retryable};

pub use capture::{CaptureDeviceSession, DeviceIdentity, DeviceSource, LockState, ScanChannel};
pub use config::DctConfig;
pub use consumer::{Consumer, RawConsumer, SinkTarget};
pub use context::CaptureContext;
pub use producer::{Producer, ProducerKind, ProducerSource};
pub use rtsp::RtspControlSession;
pub use session::SessionService;
pub use upload::UploadSession;
