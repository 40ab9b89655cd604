//! Process-wide state, passed explicitly to whatever needs it.
//!
//! ```rust
//! use std::sync::Arc;
//! use dct_capture::capture::{DeviceIdentity, DeviceSource, PassthroughTuner};
//! use dct_capture::config::DctConfig;
//! use dct_capture::context::CaptureContext;
//!
//! let context = CaptureContext::new(DctConfig::default());
//! let device = context.create_device(
//!     DeviceIdentity::standalone("DCT-Tuner 0", 1),
//!     Arc::new(PassthroughTuner),
//!     DeviceSource::Http { urls: Vec::new() },
//! );
//! assert_eq!(context.devices().get(1).unwrap().name(), device.name());
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::capture::{CaptureDeviceSession, DeviceIdentity, DeviceSource, PoolManager, Tuner};
use crate::config::DctConfig;
use crate::core::port_pool::PortPool;

/// Devices by identity hash.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<i32, Arc<CaptureDeviceSession>>>,
}

impl DeviceRegistry {
    /// Adds `device`, returning the device it replaced, if any.
    pub fn register(&self, device: Arc<CaptureDeviceSession>) -> Option<Arc<CaptureDeviceSession>> {
        self.devices.write().insert(device.hash(), device)
    }

    pub fn remove(&self, hash: i32) -> Option<Arc<CaptureDeviceSession>> {
        self.devices.write().remove(&hash)
    }

    pub fn get(&self, hash: i32) -> Option<Arc<CaptureDeviceSession>> {
        self.devices.read().get(&hash).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<CaptureDeviceSession>> {
        self.devices.read().values().find(|device| device.name() == name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<CaptureDeviceSession>> {
        let mut devices: Vec<_> = self.devices.read().values().cloned().collect();
        devices.sort_by(|a, b| a.name().cmp(b.name()));
        devices
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}

pub struct CaptureContext {
    config: Arc<DctConfig>,
    devices: DeviceRegistry,
    pools: PoolManager,
    ports: Arc<PortPool>,
}

impl CaptureContext {
    pub fn new(config: DctConfig) -> Self {
        let ports = Arc::new(PortPool::new(config.producer.rtp_port_low, config.producer.rtp_port_high));
        Self {
            config: Arc::new(config),
            devices: DeviceRegistry::default(),
            pools: PoolManager::new(),
            ports,
        }
    }

    pub fn config(&self) -> &Arc<DctConfig> {
        &self.config
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn pools(&self) -> &PoolManager {
        &self.pools
    }

    pub fn ports(&self) -> &Arc<PortPool> {
        &self.ports
    }

    /// Builds a device wired to the shared config and port pool and
    /// registers it with the registry and the pool manager.
    pub fn create_device(
        &self,
        identity: DeviceIdentity,
        tuner: Arc<dyn Tuner>,
        source: DeviceSource,
    ) -> Arc<CaptureDeviceSession> {
        let device = Arc::new(
            CaptureDeviceSession::new(identity, self.config.clone(), tuner, source)
                .with_port_pool(self.ports.clone()),
        );
        self.add_device(device.clone());
        device
    }

    pub fn add_device(&self, device: Arc<CaptureDeviceSession>) {
        info!(device = device.name(), hash = device.hash(), "Registered capture device");
        self.devices.register(device.clone());
        self.pools.add(device);
    }

    /// Stops and forgets the device with `hash`.
    pub fn remove_device(&self, hash: i32) -> Option<Arc<CaptureDeviceSession>> {
        let device = self.devices.remove(hash)?;
        self.pools.remove(hash);
        device.stop_device();
        info!(device = device.name(), "Removed capture device");
        Some(device)
    }

    /// Stops every registered device and waits for its threads.
    pub fn shutdown(&self) {
        for device in self.devices.all() {
            device.stop_device();
        }
    }
}
