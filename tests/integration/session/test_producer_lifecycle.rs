//! Producer restarts must never overlap, and stopping nothing must be free.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use dct_capture::config::{ConsumerConfig, SessionConfig, UploadConfig};
use dct_capture::consumer::{Consumer, RawConsumer};
use dct_capture::error::DctResult;
use dct_capture::producer::{Producer, ProducerKind, ProducerSource};
use dct_capture::session::SessionService;

/// Counts how many instances are inside `run` at the same time.
#[derive(Default)]
struct Census {
    alive: AtomicUsize,
    max_alive: AtomicUsize,
    runs: AtomicUsize,
}

struct InstrumentedProducer {
    census: Arc<Census>,
    running: AtomicBool,
    stop: AtomicBool,
}

impl InstrumentedProducer {
    fn new(census: Arc<Census>) -> Self {
        Self {
            census,
            running: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        }
    }
}

impl Producer for InstrumentedProducer {
    fn kind(&self) -> ProducerKind {
        ProducerKind::Stream
    }

    fn set_consumer(&self, _consumer: Arc<dyn Consumer>) -> DctResult<()> {
        Ok(())
    }

    fn bind(&self, _source: ProducerSource) -> DctResult<()> {
        Ok(())
    }

    fn run(&self) {
        let alive = self.census.alive.fetch_add(1, Ordering::SeqCst) + 1;
        self.census.max_alive.fetch_max(alive, Ordering::SeqCst);
        self.census.runs.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        while !self.stop.load(Ordering::SeqCst) {
            thread::park_timeout(Duration::from_millis(2));
        }

        self.running.store(false, Ordering::SeqCst);
        self.census.alive.fetch_sub(1, Ordering::SeqCst);
    }

    fn stop_producing(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn packets(&self) -> u64 {
        0
    }

    fn packets_lost(&self) -> u64 {
        0
    }

    fn is_stalled(&self) -> bool {
        false
    }
}

fn service() -> SessionService {
    SessionService::new(
        "Race Tuner",
        SessionConfig {
            stop_poll_interval_ms: 10,
            ..SessionConfig::default()
        },
    )
}

fn consumer() -> Arc<dyn Consumer> {
    Arc::new(RawConsumer::new(ConsumerConfig::default(), UploadConfig::default()))
}

fn source() -> ProducerSource {
    ProducerSource::Http { urls: Vec::new() }
}

#[test]
fn test_interleaved_starts_never_overlap_producers() {
    let service = Arc::new(service());
    let census = Arc::new(Census::default());

    let workers: Vec<_> = (0..6)
        .map(|worker| {
            let service = service.clone();
            let census = census.clone();
            thread::spawn(move || {
                for round in 0..8 {
                    let producer = Arc::new(InstrumentedProducer::new(census.clone()));
                    assert!(service.start_producing(producer, consumer(), source()));
                    if (worker + round) % 3 == 0 {
                        assert!(service.stop_producing(worker % 2 == 0));
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(service.stop_producing(true));
    assert_eq!(census.alive.load(Ordering::SeqCst), 0);
    assert_eq!(census.max_alive.load(Ordering::SeqCst), 1);
    assert_eq!(census.runs.load(Ordering::SeqCst), 48);
}

#[test]
fn test_stop_with_nothing_running_is_immediate() {
    let service = service();
    let started = Instant::now();
    for _ in 0..100 {
        assert!(service.stop_producing(true));
        assert!(service.stop_consumer(true));
    }
    assert!(started.elapsed() < Duration::from_millis(50));
}

#[test]
fn test_stop_after_producer_exit_is_idempotent() {
    let service = service();
    let census = Arc::new(Census::default());
    let producer = Arc::new(InstrumentedProducer::new(census.clone()));

    assert!(service.start_producing(producer.clone(), consumer(), source()));
    assert!(service.is_producing());
    assert!(service.stop_producing(true));
    assert!(!service.is_producing());

    let started = Instant::now();
    assert!(service.stop_producing(true));
    assert!(service.stop_producing(false));
    assert!(started.elapsed() < Duration::from_millis(50));
    assert_eq!(census.alive.load(Ordering::SeqCst), 0);
}
