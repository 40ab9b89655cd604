//! # Session Service
//!
//! Owns the producer thread and the consumer thread of one capture device and
//! makes restarting them safe.
//!
//! ## Guarantees
//!
//! - At most one producer thread runs per service. `start_producing` takes the
//!   producer slot's write lock and fully stops the previous producer before
//!   binding the new one, so two producers never feed the same consumer.
//! - Stopping is idempotent. With nothing running, `stop_producing` returns
//!   `true` at once.
//! - Stopping is bounded only softly. The wait polls once per
//!   `stop_poll_interval_ms` and escalates its log level after
//!   `stop_warn_after_polls`, but never abandons the thread.
//!
//! ```text
//!  control thread                      worker threads
//!  ──────────────                      ──────────────
//!  start_producing ──write lock──▶ stop old ─▶ bind ─▶ spawn "UdpProducer-1:Tuner"
//!  start_consumer  ──write lock──▶ stop old ─▶ spawn "RawConsumer-2:Tuner"
//!  stop_producing  ──read lock───▶ signal ─▶ poll done channel (1s steps)
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::consumer::Consumer;
use crate::producer::{Producer, ProducerSource};

/// A running worker thread and the object it runs.
struct Worker<T: ?Sized> {
    handle: Arc<T>,
    thread: JoinHandle<()>,
    /// Disconnects when the thread exits
    done: Receiver<()>,
}

impl<T: ?Sized> Worker<T> {
    fn is_alive(&self) -> bool {
        !self.thread.is_finished()
    }

    fn interrupt(&self) {
        self.thread.thread().unpark();
    }
}

pub struct SessionService {
    device: String,
    config: SessionConfig,
    producer: RwLock<Option<Worker<dyn Producer>>>,
    consumer: RwLock<Option<Worker<dyn Consumer>>>,
    interrupted: AtomicBool,
    spawned: AtomicU64,
}

impl SessionService {
    pub fn new(device: impl Into<String>, config: SessionConfig) -> Self {
        Self {
            device: device.into(),
            config,
            producer: RwLock::new(None),
            consumer: RwLock::new(None),
            interrupted: AtomicBool::new(false),
            spawned: AtomicU64::new(0),
        }
    }

    /// Replaces the active producer with `producer` reading from `source`.
    ///
    /// Returns `true` once the new producer reports itself running. A source
    /// that cannot be opened fails without leaving a thread behind.
    pub fn start_producing(
        &self,
        producer: Arc<dyn Producer>,
        consumer: Arc<dyn Consumer>,
        source: ProducerSource,
    ) -> bool {
        let mut slot = self.producer.write();

        if let Some(previous) = slot.as_ref() {
            if !self.stop_producer(previous, true) {
                warn!(device = self.device.as_str(), "Waiting for producer thread to exit was interrupted");
                return false;
            }
        }
        if let Some(previous) = slot.take() {
            self.reap(previous, "producer");
        }

        let kind = producer.kind();
        if let Err(e) = producer.set_consumer(consumer) {
            error!(device = self.device.as_str(), error = %e, "Unable to attach consumer to producer");
            return false;
        }
        if let Err(e) = producer.bind(source) {
            error!(device = self.device.as_str(), %kind, error = %e, "Unable to open the producer source");
            return false;
        }

        let worker = match self.spawn(&kind.to_string(), producer, |p| p.run()) {
            Ok(worker) => worker,
            Err(e) => {
                error!(device = self.device.as_str(), error = %e, "Unable to start producer thread");
                return false;
            }
        };

        let confirmed = self.confirm_running(&worker);
        if confirmed {
            info!(device = self.device.as_str(), %kind, "Producer started");
        } else {
            warn!(device = self.device.as_str(), %kind, "Producer did not report running after start");
        }
        *slot = Some(worker);
        confirmed
    }

    /// Stops the active producer, waiting for its thread when `wait` is set.
    ///
    /// Returns `false` only if the wait was interrupted.
    pub fn stop_producing(&self, wait: bool) -> bool {
        match self.producer.read().as_ref() {
            Some(worker) => self.stop_producer(worker, wait),
            None => {
                debug!(device = self.device.as_str(), "Producer was not running");
                true
            }
        }
    }

    /// Replaces the active consumer thread with one running `consumer`.
    pub fn start_consumer(&self, consumer: Arc<dyn Consumer>) -> bool {
        let mut slot = self.consumer.write();

        if let Some(previous) = slot.as_ref() {
            if !self.stop_consumer_worker(previous, true) {
                warn!(device = self.device.as_str(), "Waiting for consumer thread to exit was interrupted");
                return false;
            }
        }
        if let Some(previous) = slot.take() {
            self.reap(previous, "consumer");
        }

        match self.spawn("RawConsumer", consumer, |c| c.run()) {
            Ok(worker) => {
                *slot = Some(worker);
                true
            }
            Err(e) => {
                error!(device = self.device.as_str(), error = %e, "Unable to start consumer thread");
                false
            }
        }
    }

    pub fn stop_consumer(&self, wait: bool) -> bool {
        match self.consumer.read().as_ref() {
            Some(worker) => self.stop_consumer_worker(worker, wait),
            None => {
                debug!(device = self.device.as_str(), "Consumer was not running");
                true
            }
        }
    }

    pub fn is_producing(&self) -> bool {
        self.producer
            .read()
            .as_ref()
            .is_some_and(|worker| worker.is_alive() && worker.handle.is_running())
    }

    pub fn is_consuming(&self) -> bool {
        self.consumer
            .read()
            .as_ref()
            .is_some_and(|worker| worker.is_alive() && worker.handle.is_running())
    }

    /// Whether a consumer thread exists, even if it has not started running yet.
    pub fn is_consumer_alive(&self) -> bool {
        self.consumer.read().as_ref().is_some_and(Worker::is_alive)
    }

    pub fn producer(&self) -> Option<Arc<dyn Producer>> {
        self.producer.read().as_ref().map(|worker| worker.handle.clone())
    }

    pub fn consumer(&self) -> Option<Arc<dyn Consumer>> {
        self.consumer.read().as_ref().map(|worker| worker.handle.clone())
    }

    /// Makes the current or next stop wait return `false` at its next poll.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    fn stop_producer(&self, worker: &Worker<dyn Producer>, wait: bool) -> bool {
        if !worker.is_alive() {
            debug!(device = self.device.as_str(), "Producer was not running");
            return true;
        }

        debug!(device = self.device.as_str(), "Stopping producer thread...");
        let signal = || {
            worker.handle.stop_producing();
            worker.interrupt();
        };
        signal();
        !wait || self.wait_for_exit(&worker.done, "producer", signal)
    }

    fn stop_consumer_worker(&self, worker: &Worker<dyn Consumer>, wait: bool) -> bool {
        if !worker.is_alive() {
            debug!(device = self.device.as_str(), "Consumer was not running");
            return true;
        }

        debug!(device = self.device.as_str(), "Stopping consumer thread...");
        let signal = || {
            worker.handle.stop_consumer();
            worker.interrupt();
        };
        signal();
        !wait || self.wait_for_exit(&worker.done, "consumer", signal)
    }

    /// Polls `done` until the worker exits. A stop request is re-sent on every
    /// poll in case the worker had not started listening for it yet.
    fn wait_for_exit(&self, done: &Receiver<()>, what: &str, resignal: impl Fn()) -> bool {
        let mut polls = 0u32;
        loop {
            match done.recv_timeout(self.config.stop_poll_interval()) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return true,
                Err(RecvTimeoutError::Timeout) => {
                    if self.interrupted.swap(false, Ordering::SeqCst) {
                        debug!(device = self.device.as_str(), "Waiting for {what} thread to stop was interrupted");
                        return false;
                    }

                    polls += 1;
                    if polls <= self.config.stop_warn_after_polls {
                        debug!(device = self.device.as_str(), "Waiting for {what} thread to stop...");
                    } else {
                        warn!(
                            device = self.device.as_str(),
                            polls, "Waiting for {what} thread to stop for over {polls} polls"
                        );
                    }
                    resignal();
                }
            }
        }
    }

    /// Joins an exited worker. Returns `false` if its thread panicked.
    fn reap<T: ?Sized>(&self, worker: Worker<T>, what: &str) -> bool {
        let name = worker.thread.thread().name().unwrap_or("unnamed").to_string();
        match worker.thread.join() {
            Ok(()) => true,
            Err(_) => {
                error!(device = self.device.as_str(), thread = name.as_str(), "Previous {what} thread panicked");
                false
            }
        }
    }

    /// Waits up to `start_confirm_timeout_ms` for the producer to report running.
    fn confirm_running(&self, worker: &Worker<dyn Producer>) -> bool {
        let deadline = Instant::now() + self.config.start_confirm_timeout();
        loop {
            if worker.handle.is_running() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            if let Err(RecvTimeoutError::Disconnected) =
                worker.done.recv_timeout(Duration::from_millis(5))
            {
                return worker.handle.is_running();
            }
        }
    }

    fn spawn<T: ?Sized + Send + Sync + 'static>(
        &self,
        kind: &str,
        handle: Arc<T>,
        body: fn(&T),
    ) -> std::io::Result<Worker<T>> {
        let number = self.spawned.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("{kind}-{number}:{}", self.device);
        let (sender, done) = bounded::<()>(0);
        let runner = handle.clone();
        let thread = thread::Builder::new().name(name).spawn(move || {
            let _done = sender;
            body(&runner);
        })?;
        Ok(Worker {
            handle,
            thread,
            done,
        })
    }
}

impl Drop for SessionService {
    fn drop(&mut self) {
        self.stop_producing(false);
        self.stop_consumer(false);
    }
}
