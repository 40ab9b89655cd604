//! # Capture Device Session
//!
//! One tuner as the DVR sees it: who owns it, what it is recording, and how
//! many bytes have reached the recording so far.
//!
//! ## Lock States
//!
//! ```text
//!            set_locked(true)              set_locked(false)
//!   Idle ──CAS──▶ Locking ──▶ Locked ──CAS──▶ Unlocking ──▶ Idle
//!                   │                            │
//!                   └── waits for an offline ────┘
//!                       scan to let go
//! ```
//!
//! Exactly one caller wins the compare-and-set out of `Idle`. Losers get
//! `false` at once so a pool selector can move on to the next device. The
//! winner then takes the exclusive lock, which an offline channel scan holds
//! while it runs. Scans poll the lock state and give up as soon as they see
//! anything other than `Idle`.
//!
//! `recorded_bytes` is a shared atomic counter that the consumer thread bumps
//! after every sink write, so reading it never waits on the data path.

pub mod pool;
pub mod source;
pub mod tuner;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::DctConfig;
use crate::consumer::{Consumer, RawConsumer, SinkTarget};
use crate::core::port_pool::PortPool;
use crate::producer::{HttpProducer, Producer, ProducerSource, StreamProducer, UdpProducer};
use crate::rtsp::{RtspControlSession, RtspPhase, RtspTransport};
use crate::session::SessionService;

pub use pool::PoolManager;
pub use source::{DeviceSource, StreamOpener};
pub use tuner::{CopyProtection, PassthroughTuner, Tuner};

/// How often an offline scan re-checks progress and copy protection.
const SCAN_POLL: Duration = Duration::from_secs(1);
/// How often a scan checks whether the DVR wants the device back.
const SCAN_LOCK_CHECK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockState {
    Idle = 0,
    Locking = 1,
    Locked = 2,
    Unlocking = 3,
}

impl LockState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Locking,
            2 => Self::Locked,
            3 => Self::Unlocking,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Locking => "locking",
            Self::Locked => "locked",
            Self::Unlocking => "unlocking",
        };
        f.write_str(name)
    }
}

/// Stable identity of a capture device and the board it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub name: String,
    pub hash: i32,
    pub parent_name: String,
    pub parent_hash: i32,
}

impl DeviceIdentity {
    /// A device that is its own parent.
    pub fn standalone(name: impl Into<String>, hash: i32) -> Self {
        let name = name.into();
        Self {
            parent_name: name.clone(),
            name,
            hash,
            parent_hash: hash,
        }
    }
}

/// Result of an offline channel scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanChannel {
    pub channel: String,
    pub cci: CopyProtection,
    pub signal_strength: i32,
    pub tunable: bool,
}

impl ScanChannel {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            cci: CopyProtection::Unknown,
            signal_strength: 0,
            tunable: false,
        }
    }
}

#[derive(Debug, Default)]
struct RecordInfo {
    last_channel: Option<String>,
    target: Option<SinkTarget>,
    quality: String,
    start: Option<SystemTime>,
    buffer_size: u64,
}

pub struct CaptureDeviceSession {
    identity: DeviceIdentity,
    config: Arc<DctConfig>,
    tuner: Arc<dyn Tuner>,
    source: DeviceSource,
    session: SessionService,
    rtsp: Mutex<RtspControlSession>,
    port_pool: Option<Arc<PortPool>>,
    /// Pooled RTP port kept across encodings until `stop_device`
    rtp_port: Mutex<Option<u16>>,
    lock_state: AtomicU8,
    external_locked: AtomicBool,
    /// Held by offline scans and by encoding changes
    exclusive: Mutex<()>,
    merit: AtomicI32,
    pool_name: RwLock<Option<String>>,
    recorded_bytes: Arc<AtomicU64>,
    record: Mutex<RecordInfo>,
}

impl fmt::Debug for CaptureDeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureDeviceSession")
            .field("identity", &self.identity)
            .field("source", &self.source)
            .field("lock_state", &self.lock_state())
            .field("recorded_bytes", &self.recorded_bytes())
            .finish_non_exhaustive()
    }
}

impl CaptureDeviceSession {
    pub fn new(
        identity: DeviceIdentity,
        config: Arc<DctConfig>,
        tuner: Arc<dyn Tuner>,
        source: DeviceSource,
    ) -> Self {
        let session = SessionService::new(identity.name.clone(), config.session.clone());
        let rtsp = RtspControlSession::new(config.rtsp.clone());
        Self {
            identity,
            tuner,
            source,
            session,
            rtsp: Mutex::new(rtsp),
            port_pool: None,
            rtp_port: Mutex::new(None),
            lock_state: AtomicU8::new(LockState::Idle as u8),
            external_locked: AtomicBool::new(false),
            exclusive: Mutex::new(()),
            merit: AtomicI32::new(0),
            pool_name: RwLock::new(None),
            recorded_bytes: Arc::new(AtomicU64::new(0)),
            record: Mutex::new(RecordInfo::default()),
            config,
        }
    }

    /// Leases RTP ports from `pool` instead of using an ephemeral port.
    pub fn with_port_pool(mut self, pool: Arc<PortPool>) -> Self {
        self.port_pool = Some(pool);
        self
    }

    pub fn with_rtsp_transport(self, transport: Box<dyn RtspTransport>) -> Self {
        let rtsp = RtspControlSession::with_transport(self.config.rtsp.clone(), transport);
        *self.rtsp.lock() = rtsp;
        self
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn hash(&self) -> i32 {
        self.identity.hash
    }

    pub fn source(&self) -> &DeviceSource {
        &self.source
    }

    pub fn is_ready(&self) -> bool {
        self.tuner.is_ready()
    }

    // Locking

    pub fn lock_state(&self) -> LockState {
        LockState::from_u8(self.lock_state.load(Ordering::SeqCst))
    }

    /// Anything but `Idle` counts as locked so scans back off early.
    pub fn is_locked(&self) -> bool {
        self.lock_state() != LockState::Idle
    }

    /// Takes or releases exclusive DVR ownership of the device.
    ///
    /// Returns `false` without waiting if the device is already in the
    /// requested state or another caller is changing it.
    pub fn set_locked(&self, locked: bool) -> bool {
        let (from, through, to) = if locked {
            (LockState::Idle, LockState::Locking, LockState::Locked)
        } else {
            (LockState::Locked, LockState::Unlocking, LockState::Idle)
        };

        if self
            .lock_state
            .compare_exchange(from as u8, through as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(
                device = self.name(),
                state = %self.lock_state(),
                "Capture device was already {}",
                if locked { "locked" } else { "unlocked" }
            );
            return false;
        }

        let started = Instant::now();
        {
            let _exclusive = self.exclusive.lock();
            self.lock_state.store(to as u8, Ordering::SeqCst);
        }
        info!(
            device = self.name(),
            waited_ms = started.elapsed().as_millis() as u64,
            "Capture device is now {}",
            if locked { "locked" } else { "unlocked" }
        );
        true
    }

    pub fn is_external_locked(&self) -> bool {
        self.external_locked.load(Ordering::SeqCst)
    }

    /// Marks the device as owned by another application.
    pub fn set_external_locked(&self, locked: bool) -> bool {
        let previous = self.external_locked.swap(locked, Ordering::SeqCst);
        if previous != locked {
            info!(device = self.name(), locked, "External lock changed");
        }
        true
    }

    pub fn merit(&self) -> i32 {
        self.merit.load(Ordering::SeqCst)
    }

    pub fn set_merit(&self, merit: i32) {
        self.merit.store(merit, Ordering::SeqCst);
    }

    pub fn pool_name(&self) -> Option<String> {
        self.pool_name.read().clone()
    }

    pub fn set_pool_name(&self, pool_name: Option<String>) {
        *self.pool_name.write() = pool_name;
    }

    // Recording

    /// Tunes `channel` and starts recording into `target`.
    ///
    /// Requires the device to be locked. A `buffer_size` above zero turns the
    /// recording into a ring of that many bytes.
    pub fn start_encoding(
        &self,
        channel: &str,
        target: SinkTarget,
        quality: &str,
        buffer_size: u64,
    ) -> bool {
        if !self.is_locked() {
            warn!(device = self.name(), channel, "Cannot start encoding on a device that is not locked");
            return false;
        }
        let _exclusive = self.exclusive.lock();
        self.engage(channel, Some(target), quality, buffer_size)
    }

    /// Moves the running recording to `target` without interrupting capture.
    pub fn switch_encoding(&self, target: SinkTarget, buffer_size: u64) -> bool {
        let Some(consumer) = self.session.consumer() else {
            warn!(device = self.name(), "Cannot switch, nothing is being recorded");
            return false;
        };
        if !self.session.is_consuming() {
            warn!(device = self.name(), "Cannot switch, the consumer is not running");
            return false;
        }
        if !consumer.can_switch() {
            warn!(device = self.name(), "The consumer does not support switching");
            return false;
        }

        info!(device = self.name(), %target, buffer_size, "Switching encoding");
        if !consumer.switch_to(target.clone(), buffer_size) {
            error!(device = self.name(), %target, "Switching encoding failed");
            return false;
        }

        let mut record = self.record.lock();
        record.target = Some(target);
        record.buffer_size = buffer_size;
        record.start = Some(SystemTime::now());
        true
    }

    /// Signals the producer and consumer to stop. Does not wait.
    pub fn stop_encoding(&self) {
        info!(device = self.name(), "Stopping encoding");
        self.session.stop_producing(false);
        self.session.stop_consumer(false);
    }

    /// Stops everything, waits for both threads, and releases the remote
    /// stream and the RTP port.
    pub fn stop_device(&self) {
        info!(device = self.name(), "Stopping device");
        self.session.stop_producing(true);
        self.session.stop_consumer(true);

        {
            let mut rtsp = self.rtsp.lock();
            if rtsp.phase() == RtspPhase::Playing {
                rtsp.stop_rtp_stream();
            }
        }
        if let (Some(pool), Some(port)) = (&self.port_pool, self.rtp_port.lock().take()) {
            pool.release(port);
        }
    }

    pub fn recorded_bytes(&self) -> u64 {
        self.recorded_bytes.load(Ordering::SeqCst)
    }

    pub fn is_producing(&self) -> bool {
        self.session.is_producing()
    }

    pub fn is_consuming(&self) -> bool {
        self.session.is_consuming()
    }

    pub fn last_channel(&self) -> Option<String> {
        self.record.lock().last_channel.clone()
    }

    pub fn record_target(&self) -> Option<SinkTarget> {
        self.record.lock().target.clone()
    }

    pub fn record_quality(&self) -> String {
        self.record.lock().quality.clone()
    }

    pub fn record_start(&self) -> Option<SystemTime> {
        self.record.lock().start
    }

    pub fn record_buffer_size(&self) -> u64 {
        self.record.lock().buffer_size
    }

    /// Consumer status line for display, if a consumer exists.
    pub fn stream_state(&self) -> Option<String> {
        self.session.consumer().map(|consumer| consumer.state_message())
    }

    // Scanning

    /// Tunes `scan.channel` while the DVR is not using the device and fills in
    /// what was learned.
    ///
    /// Returns `false` and leaves `scan` untouched if the device is or becomes
    /// locked, or if the channel could not be tuned.
    pub fn channel_info_offline(&self, scan: &mut ScanChannel, skip_cci: bool) -> bool {
        if self.is_locked() || self.is_external_locked() {
            return false;
        }

        let _exclusive = self.exclusive.lock();
        if self.is_locked() {
            return false;
        }
        if !self.engage(&scan.channel, None, "", 0) {
            return false;
        }

        let device = &self.config.device;
        let mut remaining = device.offline_detection_wait_s;
        while self.session.is_consumer_alive()
            && self.recorded_bytes() < device.offline_detection_min_bytes
            && remaining > 0
        {
            remaining -= 1;
            if !self.scan_wait() {
                self.stop_encoding();
                return false;
            }
        }

        let mut cci = self.tuner.copy_protection();
        while !skip_cci && !cci.is_settled() && remaining > 0 {
            remaining -= 1;
            if !self.scan_wait() {
                self.stop_encoding();
                return false;
            }
            cci = self.tuner.copy_protection();
        }

        let signal_strength = self.tuner.signal_strength();
        let tunable = cci.is_recordable() && self.recorded_bytes() > device.offline_detection_min_bytes;
        self.stop_encoding();

        if self.is_locked() {
            debug!(device = self.name(), channel = scan.channel.as_str(), "Device was locked during the scan");
            return false;
        }
        scan.cci = cci;
        scan.signal_strength = signal_strength;
        scan.tunable = tunable;
        info!(
            device = self.name(),
            channel = scan.channel.as_str(),
            %cci,
            signal_strength,
            tunable,
            "Offline channel scan complete"
        );
        true
    }

    /// Sleeps one scan poll. Returns `false` as soon as the device gets locked.
    fn scan_wait(&self) -> bool {
        let deadline = Instant::now() + SCAN_POLL;
        while Instant::now() < deadline {
            if self.is_locked() {
                return false;
            }
            thread::sleep(SCAN_LOCK_CHECK);
        }
        !self.is_locked()
    }

    /// Tunes and restarts the producer and consumer. A missing target means
    /// consume-to-null. The exclusive lock must be held.
    fn engage(&self, channel: &str, target: Option<SinkTarget>, quality: &str, buffer_size: u64) -> bool {
        if !self.tuner.is_ready() {
            warn!(device = self.name(), channel, "Capture device is not ready");
            return false;
        }

        match &target {
            Some(target) => info!(device = self.name(), channel, %target, "Starting the encoding"),
            None => info!(device = self.name(), channel, "Starting a channel scan"),
        }

        if !self.session.stop_producing(true) || !self.session.stop_consumer(true) {
            warn!(device = self.name(), "Waiting for the previous encoding to stop was interrupted");
            return false;
        }

        if let Err(e) = self.tuner.tune(channel) {
            error!(device = self.name(), channel, error = %e, "Unable to tune the channel");
            return false;
        }

        let consumer = Arc::new(
            RawConsumer::new(self.config.consumer.clone(), self.config.upload.clone())
                .with_counter(self.recorded_bytes.clone()),
        );
        consumer.set_encoding_quality(quality);
        consumer.set_record_buffer_size(buffer_size);
        match &target {
            Some(target) => {
                if !consumer.consume_to(target.clone()) {
                    return false;
                }
            }
            None => consumer.consume_to_null(true),
        }

        let (producer, source) = match self.producer_for(channel) {
            Some(pair) => pair,
            None => return false,
        };

        self.recorded_bytes.store(0, Ordering::SeqCst);
        if !self.session.start_producing(producer.clone(), consumer.clone(), source) {
            error!(device = self.name(), channel, "Unable to start the producer");
            return false;
        }
        self.track_rtp_port(producer.as_ref());

        if let DeviceSource::Rtp { uri, .. } = &self.source {
            let Some(port) = producer.local_port() else {
                error!(device = self.name(), "RTP producer has no local port");
                self.session.stop_producing(false);
                return false;
            };
            let mut rtsp = self.rtsp.lock();
            if rtsp.phase() == RtspPhase::Playing {
                rtsp.stop_rtp_stream();
            }
            if !rtsp.configure_rtp_stream(uri, port) {
                self.session.stop_producing(false);
                return false;
            }
        }

        if !self.session.start_consumer(consumer) {
            error!(device = self.name(), "Unable to start the consumer");
            self.session.stop_producing(false);
            return false;
        }

        let mut record = self.record.lock();
        record.last_channel = Some(channel.to_string());
        record.target = target;
        record.quality = quality.to_string();
        record.start = Some(SystemTime::now());
        record.buffer_size = buffer_size;
        true
    }

    fn producer_for(&self, channel: &str) -> Option<(Arc<dyn Producer>, ProducerSource)> {
        let producer_config = self.config.producer.clone();
        let owner = self.identity.name.clone();
        match &self.source {
            DeviceSource::Rtp { .. } => {
                let mut producer = UdpProducer::new(producer_config, owner);
                if let Some(pool) = &self.port_pool {
                    producer = producer.with_port_pool(pool.clone());
                }
                let source = ProducerSource::Udp {
                    remote_ip: self.source.rtp_sender(),
                    local_port: self.lease_rtp_port(),
                };
                Some((Arc::new(producer), source))
            }
            DeviceSource::Udp {
                remote_ip,
                local_port,
            } => Some((
                Arc::new(UdpProducer::new(producer_config, owner)),
                ProducerSource::Udp {
                    remote_ip: *remote_ip,
                    local_port: *local_port,
                },
            )),
            DeviceSource::Http { urls } => Some((
                Arc::new(HttpProducer::new(producer_config, owner)),
                ProducerSource::Http { urls: urls.clone() },
            )),
            DeviceSource::Stream(open) => match open(channel) {
                Ok(reader) => Some((
                    Arc::new(StreamProducer::new(producer_config, owner)),
                    ProducerSource::Stream(reader),
                )),
                Err(e) => {
                    error!(device = self.name(), channel, error = %e, "Unable to open the capture stream");
                    None
                }
            },
        }
    }

    /// The pooled RTP port, leasing one on first use. Zero means ephemeral.
    fn lease_rtp_port(&self) -> u16 {
        let mut leased = self.rtp_port.lock();
        if let Some(port) = *leased {
            return port;
        }
        let port = self.port_pool.as_ref().and_then(|pool| pool.take(&self.identity.name));
        *leased = port;
        port.unwrap_or(0)
    }

    /// Follows a producer that had to move to another pooled port.
    fn track_rtp_port(&self, producer: &dyn Producer) {
        let mut leased = self.rtp_port.lock();
        if let (Some(current), Some(bound)) = (*leased, producer.local_port()) {
            if current != bound {
                debug!(device = self.name(), from = current, to = bound, "RTP port moved");
                *leased = Some(bound);
            }
        }
    }
}

impl Drop for CaptureDeviceSession {
    fn drop(&mut self) {
        if let (Some(pool), Some(port)) = (&self.port_pool, self.rtp_port.lock().take()) {
            pool.release(port);
        }
    }
}
