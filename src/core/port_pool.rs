//! # Port Pool Module
//!
//! Hands out local UDP ports for RTP reception.
//!
//! ## Overview
//!
//! RTSP asks the tuner to stream to `client_port=P-(P+1)`, so every port handed
//! out is even and the odd port above it is implicitly reserved for RTCP. Ports
//! are tracked per owner (the device name) so the log can say who holds what.
//!
//! ```text
//! 8300 8302 8304 ... 8498
//!  ▲    ▲
//!  │    └── "DCT-Tuner 1"
//!  └─────── "DCT-Tuner 0"
//! ```
//!
//! ## Example
//!
//! ```rust
//! use dct_capture::core::port_pool::PortPool;
//!
//! let pool = PortPool::new(8300, 8310);
//! let port = pool.take("DCT-Tuner 0").unwrap();
//! assert_eq!(port % 2, 0);
//!
//! pool.release(port);
//! let (in_use, capacity) = pool.stats();
//! assert_eq!((in_use, capacity), (0, 5));
//! ```

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Thread-safe allocator of even UDP ports within `[low, high)`.
#[derive(Debug)]
pub struct PortPool {
    /// Ports currently handed out, mapped to their owner
    leased: Mutex<BTreeMap<u16, String>>,
    low: u16,
    high: u16,
}

impl PortPool {
    /// Creates a pool over the even ports in `[low, high)`.
    ///
    /// An odd `low` is rounded up to the next even port.
    pub fn new(low: u16, high: u16) -> Self {
        let low = low.saturating_add(low % 2);
        Self {
            leased: Mutex::new(BTreeMap::new()),
            low,
            high: high.max(low),
        }
    }

    /// Leases the lowest free port to `owner`.
    ///
    /// Returns `None` when every port in the range is leased.
    pub fn take(&self, owner: &str) -> Option<u16> {
        let mut leased = self.leased.lock();
        let port = (self.low..self.high)
            .step_by(2)
            .find(|port| !leased.contains_key(port));

        match port {
            Some(port) => {
                leased.insert(port, owner.to_string());
                debug!(port, owner, "Leased RTP port");
                Some(port)
            }
            None => {
                warn!(low = self.low, high = self.high, owner, "No free RTP ports left");
                None
            }
        }
    }

    /// Leases the lowest free port other than `previous`, releasing `previous`.
    ///
    /// Used when binding `previous` failed and another port should be tried.
    pub fn replace(&self, previous: u16, owner: &str) -> Option<u16> {
        let mut leased = self.leased.lock();
        // Keep `previous` marked while searching so it is not handed straight back.
        leased.insert(previous, owner.to_string());
        let next = (self.low..self.high)
            .step_by(2)
            .find(|port| !leased.contains_key(port));
        leased.remove(&previous);
        if let Some(port) = next {
            leased.insert(port, owner.to_string());
            debug!(previous, port, owner, "Replaced RTP port");
        }
        next
    }

    /// Returns a port to the pool. Unknown ports are ignored.
    pub fn release(&self, port: u16) {
        if let Some(owner) = self.leased.lock().remove(&port) {
            debug!(port, owner = owner.as_str(), "Released RTP port");
        }
    }

    /// Returns `(in_use, capacity)`.
    pub fn stats(&self) -> (usize, usize) {
        let capacity = (self.high.saturating_sub(self.low) as usize).div_ceil(2);
        (self.leased.lock().len(), capacity)
    }
}
