//! # Configuration Module
//!
//! Tunables for every layer of the capture transport core, loadable from JSON.

pub mod config;

pub use config::{
    ConsumerConfig, DctConfig, DeviceConfig, ProducerConfig, RtspConfig, SessionConfig,
    UploadConfig,
};
