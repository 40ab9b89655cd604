//! # Producers
//!
//! A producer pulls transport-stream bytes from a capture source and hands them
//! to its consumer. Each producer runs [`Producer::run`] on a dedicated thread
//! owned by [`SessionService`](crate::session::SessionService).
//!
//! | Variant | Source | Stops within |
//! |---------|--------|--------------|
//! | [`UdpProducer`] | RTP over UDP | one socket read timeout |
//! | [`HttpProducer`] | HTTP(S) GET body | the next chunk |
//! | [`StreamProducer`] | any `Read` | the next read or EOF wait |
//!
//! Producers never return errors from their run loop. Failures are logged and
//! end the loop, leaving [`Producer::is_running`] false for the control thread
//! to notice.

pub mod http;
pub mod rtp;
pub mod stream;
pub mod udp;

use std::fmt;
use std::io::Read;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use url::Url;

use crate::consumer::Consumer;
use crate::error::{DctError, DctResult};

pub use http::HttpProducer;
pub use stream::StreamProducer;
pub use udp::UdpProducer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProducerKind {
    Udp,
    Http,
    Stream,
}

impl fmt::Display for ProducerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Udp => "UdpProducer",
            Self::Http => "HttpProducer",
            Self::Stream => "StreamProducer",
        })
    }
}

/// What a producer reads from.
pub enum ProducerSource {
    /// Listen on `local_port`, accepting datagrams only from `remote_ip` when set.
    Udp {
        remote_ip: Option<IpAddr>,
        local_port: u16,
    },
    /// Fetch the first reachable URL, rotating through the list on failure.
    Http { urls: Vec<Url> },
    Stream(Box<dyn Read + Send>),
}

impl ProducerSource {
    pub fn kind(&self) -> ProducerKind {
        match self {
            Self::Udp { .. } => ProducerKind::Udp,
            Self::Http { .. } => ProducerKind::Http,
            Self::Stream(_) => ProducerKind::Stream,
        }
    }
}

impl fmt::Debug for ProducerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp {
                remote_ip,
                local_port,
            } => f
                .debug_struct("Udp")
                .field("remote_ip", remote_ip)
                .field("local_port", local_port)
                .finish(),
            Self::Http { urls } => f.debug_struct("Http").field("urls", urls).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Capability interface shared by every source transport.
pub trait Producer: Send + Sync {
    fn kind(&self) -> ProducerKind;

    /// Sets where received bytes go. Rejected while running.
    fn set_consumer(&self, consumer: Arc<dyn Consumer>) -> DctResult<()>;

    /// Opens the source. Rejected while running.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be opened or is the wrong kind
    /// for this producer.
    fn bind(&self, source: ProducerSource) -> DctResult<()>;

    /// Moves bytes from the source to the consumer until stopped or the
    /// source fails. Blocks the calling thread.
    fn run(&self);

    /// Asks the run loop to end. Does not wait.
    fn stop_producing(&self);

    fn is_running(&self) -> bool;

    /// Datagrams (UDP) or reads (HTTP, stream) delivered to the consumer.
    fn packets(&self) -> u64;

    fn packets_lost(&self) -> u64;

    /// True when running but nothing has arrived for a while.
    fn is_stalled(&self) -> bool;

    fn local_port(&self) -> Option<u16> {
        None
    }
}

/// Run-state bookkeeping shared by the producer variants.
pub(crate) struct ProducerState {
    running: AtomicBool,
    stop_requested: AtomicBool,
    consumer: Mutex<Option<Arc<dyn Consumer>>>,
    packets: AtomicU64,
    packets_lost: AtomicU64,
    last_packet: Mutex<Option<Instant>>,
    thread: Mutex<Option<Thread>>,
}

impl ProducerState {
    pub(crate) fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            consumer: Mutex::new(None),
            packets: AtomicU64::new(0),
            packets_lost: AtomicU64::new(0),
            last_packet: Mutex::new(None),
            thread: Mutex::new(None),
        }
    }

    pub(crate) fn ensure_idle(&self, operation: &str) -> DctResult<()> {
        if self.is_running() {
            return Err(DctError::state("running", operation, "producer is running"));
        }
        Ok(())
    }

    pub(crate) fn set_consumer(&self, consumer: Arc<dyn Consumer>) -> DctResult<()> {
        self.ensure_idle("set_consumer")?;
        *self.consumer.lock() = Some(consumer);
        Ok(())
    }

    pub(crate) fn consumer(&self) -> Option<Arc<dyn Consumer>> {
        self.consumer.lock().clone()
    }

    /// Marks the loop started on the current thread.
    ///
    /// Returns `false` if a stop was requested before the loop got going.
    pub(crate) fn begin_run(&self) -> bool {
        *self.thread.lock() = Some(thread::current());
        *self.last_packet.lock() = Some(Instant::now());
        self.packets.store(0, Ordering::Relaxed);
        self.packets_lost.store(0, Ordering::Relaxed);
        self.running.store(true, Ordering::SeqCst);
        !self.stop_requested()
    }

    pub(crate) fn end_run(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop_requested.store(false, Ordering::SeqCst);
        *self.thread.lock() = None;
    }

    pub(crate) fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.lock().as_ref() {
            thread.unpark();
        }
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn record_packet(&self) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        *self.last_packet.lock() = Some(Instant::now());
    }

    pub(crate) fn record_lost(&self, count: u64) {
        self.packets_lost.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub(crate) fn packets_lost(&self) -> u64 {
        self.packets_lost.load(Ordering::Relaxed)
    }

    pub(crate) fn idle_for(&self) -> Option<Duration> {
        self.last_packet.lock().map(|at| at.elapsed())
    }

    pub(crate) fn is_stalled(&self, after: Duration) -> bool {
        self.is_running() && self.idle_for().is_some_and(|idle| idle > after)
    }

    /// Sleeps up to `duration`, returning early when a stop is requested.
    pub(crate) fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stop_requested() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::park_timeout(deadline - now);
        }
    }
}
