//! Merit-ordered device pools.
//!
//! A pool is a set of devices the DVR sees as one virtual tuner. Selection is
//! just "lock the best free member"; what to do when that fails is up to the
//! caller.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::CaptureDeviceSession;

#[derive(Debug, Default)]
pub struct PoolManager {
    devices: RwLock<Vec<Arc<CaptureDeviceSession>>>,
}

impl PoolManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `device`. Its pool membership is read from the device on every
    /// selection, so renaming its pool later takes effect immediately.
    pub fn add(&self, device: Arc<CaptureDeviceSession>) {
        let mut devices = self.devices.write();
        devices.retain(|existing| existing.hash() != device.hash());
        devices.push(device);
    }

    pub fn remove(&self, hash: i32) -> Option<Arc<CaptureDeviceSession>> {
        let mut devices = self.devices.write();
        let index = devices.iter().position(|device| device.hash() == hash)?;
        Some(devices.remove(index))
    }

    /// Members of `pool`, highest merit first.
    pub fn members(&self, pool: &str) -> Vec<Arc<CaptureDeviceSession>> {
        let mut members: Vec<_> = self
            .devices
            .read()
            .iter()
            .filter(|device| device.pool_name().as_deref() == Some(pool))
            .cloned()
            .collect();
        members.sort_by_key(|device| std::cmp::Reverse(device.merit()));
        members
    }

    /// Locks the highest-merit member of `pool` that accepts the lock.
    pub fn lock_best(&self, pool: &str) -> Option<Arc<CaptureDeviceSession>> {
        for device in self.members(pool) {
            if device.is_external_locked() {
                debug!(pool, device = device.name(), "Skipping externally locked device");
                continue;
            }
            if device.set_locked(true) {
                info!(pool, device = device.name(), merit = device.merit(), "Selected pool device");
                return Some(device);
            }
        }
        debug!(pool, "No free device in pool");
        None
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}
