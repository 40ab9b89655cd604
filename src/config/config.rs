//! # Configuration Structures
//!
//! Every layer of the transport core reads its timeouts, buffer sizes and retry
//! policy from one [`DctConfig`]. All sections implement `Default`, and every
//! field is `#[serde(default)]`, so a JSON file only needs the values it changes.
//!
//! ## Sections
//!
//! | Section | Used by | Notable defaults |
//! |---------|---------|------------------|
//! | `session` | `SessionService` | 1s stop poll, warn after 5 polls |
//! | `producer` | UDP/HTTP/stream producers | 1500 byte datagrams, ports 8300-8500 |
//! | `consumer` | `RawConsumer` | 2 MiB stream buffer, 64 KiB transfers, upload port 7818 |
//! | `rtsp` | `RtspControlSession` | 3 retries, 500ms apart |
//! | `upload` | `UploadSession` | 2s response wait, 15s CLOSE watchdog |
//! | `device` | `CaptureDeviceSession` | 8s offline detection |
//!
//! ## Examples
//!
//! ```rust
//! use dct_capture::config::DctConfig;
//!
//! let config: DctConfig = serde_json::from_str(r#"{ "rtsp": { "retry_count": 5 } }"#).unwrap();
//! assert_eq!(config.rtsp.retry_count, 5);
//! assert_eq!(config.rtsp.retry_wait_ms, 500);
//! assert!(config.validate().is_ok());
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DctError, DctResult};

/// Complete configuration for one process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DctConfig {
    pub session: SessionConfig,
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
    pub rtsp: RtspConfig,
    pub upload: UploadConfig,
    pub device: DeviceConfig,
}

impl DctConfig {
    /// Load a configuration from a JSON file and validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// fails [`DctConfig::validate`].
    pub fn from_json_file(path: impl AsRef<Path>) -> DctResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| DctError::io("read config", e).with_context(path.display().to_string()))?;
        let config: DctConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates that every section is internally consistent.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error naming the first offending field.
    pub fn validate(&self) -> DctResult<()> {
        if self.session.stop_poll_interval_ms == 0 {
            return Err(DctError::config(
                "session.stop_poll_interval_ms",
                "0",
                "must be greater than 0",
            ));
        }

        if self.rtsp.retry_count > 0 && self.rtsp.retry_wait_ms == 0 {
            return Err(DctError::config(
                "rtsp.retry_wait_ms",
                "0",
                "must be greater than 0 when retries are enabled",
            ));
        }

        let consumer = &self.consumer;
        if consumer.min_transfer_size == 0 {
            return Err(DctError::config(
                "consumer.min_transfer_size",
                "0",
                "must be greater than 0",
            ));
        }
        if consumer.min_transfer_size > consumer.max_transfer_size {
            return Err(DctError::config(
                "consumer.min_transfer_size",
                consumer.min_transfer_size.to_string(),
                format!(
                    "cannot exceed consumer.max_transfer_size ({})",
                    consumer.max_transfer_size
                ),
            ));
        }
        if consumer.stream_buffer_size < consumer.max_transfer_size {
            return Err(DctError::config(
                "consumer.stream_buffer_size",
                consumer.stream_buffer_size.to_string(),
                "must hold at least one maximum transfer",
            ));
        }

        let producer = &self.producer;
        if producer.rtp_port_low % 2 != 0 || producer.rtp_port_low >= producer.rtp_port_high {
            return Err(DctError::config(
                "producer.rtp_port_low",
                format!("{}-{}", producer.rtp_port_low, producer.rtp_port_high),
                "range must start on an even port and be non-empty",
            ));
        }
        if producer.udp_receive_buffer == 0 {
            return Err(DctError::config(
                "producer.udp_receive_buffer",
                "0",
                "must be greater than 0",
            ));
        }

        if self.upload.message_buffer_size < 64 {
            return Err(DctError::config(
                "upload.message_buffer_size",
                self.upload.message_buffer_size.to_string(),
                "must be at least 64 bytes",
            ));
        }

        Ok(())
    }
}

/// Producer start/stop coordination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interval between checks while waiting for a worker thread to exit.
    pub stop_poll_interval_ms: u64,
    /// Polls after which a slow stop is logged as a warning instead of debug.
    pub stop_warn_after_polls: u32,
    /// How long `start_producing` waits for the new producer to report running.
    pub start_confirm_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stop_poll_interval_ms: 1000,
            stop_warn_after_polls: 5,
            start_confirm_timeout_ms: 1000,
        }
    }
}

impl SessionConfig {
    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }

    pub fn start_confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.start_confirm_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Initial datagram buffer; grows when a datagram fills it.
    pub udp_receive_buffer: usize,
    /// Socket receive timeout. Bounds how long a UDP producer ignores a stop request.
    pub udp_read_timeout_ms: u64,
    /// Seconds without a datagram before the producer reports itself stalled.
    pub stalled_timeout_s: u64,
    pub port_retry_count: u32,
    pub rtp_port_low: u16,
    pub rtp_port_high: u16,
    pub http_read_buffer: usize,
    pub http_retry_wait_ms: u64,
    pub http_connect_timeout_ms: u64,
    /// Pause after a stream source reports EOF before reading again.
    pub stream_eof_wait_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            udp_receive_buffer: 1500,
            udp_read_timeout_ms: 1000,
            stalled_timeout_s: 6,
            port_retry_count: 5,
            rtp_port_low: 8300,
            rtp_port_high: 8500,
            http_read_buffer: 262_144,
            http_retry_wait_ms: 250,
            http_connect_timeout_ms: 5000,
            stream_eof_wait_ms: 1000,
        }
    }
}

impl ProducerConfig {
    pub fn udp_read_timeout(&self) -> Duration {
        Duration::from_millis(self.udp_read_timeout_ms.max(1))
    }

    pub fn stalled_timeout(&self) -> Duration {
        Duration::from_secs(self.stalled_timeout_s)
    }

    pub fn http_retry_wait(&self) -> Duration {
        Duration::from_millis(self.http_retry_wait_ms)
    }

    pub fn stream_eof_wait(&self) -> Duration {
        Duration::from_millis(self.stream_eof_wait_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Capacity of the producer/consumer ring.
    pub stream_buffer_size: usize,
    /// Overflow queue limit as a multiple of `stream_buffer_size`.
    pub max_overflow_factor: usize,
    pub min_transfer_size: usize,
    pub max_transfer_size: usize,
    /// Granularity of the wait inside `switch_to`.
    pub switch_wait_ms: u64,
    /// How long to look for an access-unit boundary before switching on any packet boundary.
    pub switch_boundary_timeout_ms: u64,
    /// Discard bytes until the first PES start before writing anything.
    pub wait_for_pes_start: bool,
    pub accepts_upload_id: bool,
    /// Media server port used for upload ID recordings.
    pub upload_port: u16,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            stream_buffer_size: 2_097_152,
            max_overflow_factor: 4,
            min_transfer_size: 65_536,
            max_transfer_size: 1_048_476,
            switch_wait_ms: 500,
            switch_boundary_timeout_ms: 2000,
            wait_for_pes_start: true,
            accepts_upload_id: true,
            upload_port: 7818,
        }
    }
}

impl ConsumerConfig {
    pub fn switch_wait(&self) -> Duration {
        Duration::from_millis(self.switch_wait_ms.max(1))
    }

    pub fn switch_boundary_timeout(&self) -> Duration {
        Duration::from_millis(self.switch_boundary_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtspConfig {
    /// Extra DESCRIBE/SETUP/PLAY attempts after the first one fails.
    pub retry_count: u32,
    pub retry_wait_ms: u64,
    pub user_agent: String,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            retry_count: 3,
            retry_wait_ms: 500,
            user_agent: "networkencoder-dct".to_string(),
            connect_timeout_ms: 5000,
            read_timeout_ms: 5000,
        }
    }
}

impl RtspConfig {
    pub fn retry_wait(&self) -> Duration {
        Duration::from_millis(self.retry_wait_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Longest wait for a single response line.
    pub response_timeout_ms: u64,
    /// Buffered partial responses older than this are discarded.
    pub stale_message_ms: u64,
    /// Socket is shut down if CLOSE is not answered within this time.
    pub close_watchdog_ms: u64,
    pub connect_timeout_ms: u64,
    pub message_buffer_size: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 2000,
            stale_message_ms: 30_000,
            close_watchdog_ms: 15_000,
            connect_timeout_ms: 5000,
            message_buffer_size: 4096,
        }
    }
}

impl UploadConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms.max(1))
    }

    pub fn stale_message(&self) -> Duration {
        Duration::from_millis(self.stale_message_ms)
    }

    pub fn close_watchdog(&self) -> Duration {
        Duration::from_millis(self.close_watchdog_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Seconds an offline channel scan waits for data and copy protection info.
    pub offline_detection_wait_s: u64,
    /// Bytes that must arrive before a scanned channel counts as tunable.
    pub offline_detection_min_bytes: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            offline_detection_wait_s: 8,
            offline_detection_min_bytes: 18_800,
        }
    }
}
