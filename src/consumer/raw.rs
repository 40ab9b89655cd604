//! Pass-through consumer that records the transport stream unchanged.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use super::sink::{FileSink, Sink};
use super::{Consumer, SinkTarget};
use crate::config::{ConsumerConfig, UploadConfig};
use crate::core::stream_buffer::{ReadOutcome, StreamBuffer};
use crate::core::ts;
use crate::error::DctResult;
use crate::upload::UploadSession;

/// Longest a drain read blocks before rechecking for stop and switch requests.
const READ_WAIT: Duration = Duration::from_millis(500);

struct SwitchRequest {
    target: SinkTarget,
    buffer_size: u64,
    /// File targets are opened by the caller so open errors fail fast
    prepared: Option<FileSink>,
    requested_at: Instant,
}

#[derive(Default)]
struct SwitchSlot {
    /// Set by the caller for the whole duration of a switch
    busy: bool,
    request: Option<SwitchRequest>,
    outcome: Option<bool>,
}

/// Records the stream as received, starting at the first PES packet.
///
/// Bytes are buffered in a [`StreamBuffer`] between the producer thread and
/// the consumer thread and written in chunks of at least `min_transfer_size`.
pub struct RawConsumer {
    config: ConsumerConfig,
    upload_config: UploadConfig,
    buffer: StreamBuffer,
    running: AtomicBool,
    stop_requested: AtomicBool,
    stalled: AtomicBool,
    bytes_streamed: Arc<AtomicU64>,
    record_buffer_size: AtomicU64,
    null_output: AtomicBool,
    target: Mutex<Option<SinkTarget>>,
    prepared: Mutex<Option<FileSink>>,
    switch: Mutex<SwitchSlot>,
    switched: Condvar,
    quality: Mutex<String>,
    program: AtomicI32,
    state_message: Mutex<String>,
}

impl RawConsumer {
    pub fn new(config: ConsumerConfig, upload_config: UploadConfig) -> Self {
        let buffer = StreamBuffer::new(config.stream_buffer_size, config.max_overflow_factor);
        Self {
            config,
            upload_config,
            buffer,
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            bytes_streamed: Arc::new(AtomicU64::new(0)),
            record_buffer_size: AtomicU64::new(0),
            null_output: AtomicBool::new(false),
            target: Mutex::new(None),
            prepared: Mutex::new(None),
            switch: Mutex::new(SwitchSlot::default()),
            switched: Condvar::new(),
            quality: Mutex::new(String::new()),
            program: AtomicI32::new(-1),
            state_message: Mutex::new("Waiting for first bytes...".to_string()),
        }
    }

    /// Counts delivered bytes into `counter` instead of a private one.
    pub fn with_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.bytes_streamed = counter;
        self
    }

    pub fn counter(&self) -> Arc<AtomicU64> {
        self.bytes_streamed.clone()
    }

    /// Bytes the producer delivered that the buffer had to drop.
    pub fn bytes_lost(&self) -> u64 {
        self.buffer.bytes_lost()
    }

    fn set_state(&self, message: impl Into<String>) {
        *self.state_message.lock() = message.into();
    }

    fn fail(&self, message: impl Into<String>) {
        self.stalled.store(true, Ordering::SeqCst);
        self.set_state(message);
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn start_upload_sink(&self, filename: &str, upload_id: i32, server: std::net::SocketAddr) -> DctResult<Option<Sink>> {
        let mut session = Box::new(UploadSession::new(self.upload_config.clone()));
        Ok(session
            .start_upload(server, filename, upload_id)?
            .then(|| Sink::Upload(session)))
    }

    fn open_sink(&self) -> Option<Sink> {
        let target = self.target.lock().clone();
        match target {
            Some(SinkTarget::Upload {
                filename,
                upload_id,
                server,
            }) => {
                match self.start_upload_sink(&filename, upload_id, server) {
                    Ok(Some(sink)) => return Some(sink),
                    Ok(None) => error!(
                        filename = filename.as_str(),
                        upload_id,
                        %server,
                        "Raw consumer did not receive OK from the media server to start uploading"
                    ),
                    Err(e) => error!(error = %e, %server, "Unable to connect to the media server to start the upload"),
                }

                info!(filename = filename.as_str(), "Attempting to write the file directly");
                match FileSink::create(&filename) {
                    Ok(file) => Some(Sink::File(file)),
                    Err(e) => {
                        error!(error = %e, "Unable to create the recording file");
                        self.fail(format!("ERROR: Unable to create the recording file '{filename}'."));
                        None
                    }
                }
            }
            Some(SinkTarget::File { path }) => {
                let prepared = self
                    .prepared
                    .lock()
                    .take()
                    .filter(|file| file.path() == path);
                match prepared.map_or_else(|| FileSink::create(&path), Ok) {
                    Ok(file) => Some(Sink::File(file)),
                    Err(e) => {
                        error!(error = %e, "Unable to create the recording file");
                        self.fail(format!(
                            "ERROR: Unable to create the recording file '{}'.",
                            path.display()
                        ));
                        None
                    }
                }
            }
            None if self.null_output.load(Ordering::SeqCst) => {
                debug!("Consuming to a null output");
                self.set_state("Consuming to a null output...");
                Some(Sink::Null)
            }
            None => {
                error!("Raw consumer does not have a file or upload ID to use");
                self.fail("ERROR: Raw consumer does not have a file or UploadID to use.");
                None
            }
        }
    }

    /// Drains the buffer into `sink` until stopped, returning the sink in use
    /// at the end, which may differ after a switch.
    fn stream(&self, mut sink: Sink) -> Sink {
        let min_transfer = self.config.min_transfer_size;
        let mut chunk = vec![0u8; self.config.max_transfer_size.max(min_transfer)];
        let mut started = !self.config.wait_for_pes_start;
        if started {
            self.set_state("Streaming...");
        } else if !matches!(sink, Sink::Null) {
            self.set_state("Waiting for PES start byte...");
        }

        let mut closed = false;
        while !closed && !self.stop_requested() {
            let mut filled = 0;
            while filled < min_transfer && !self.stop_requested() {
                match self.buffer.read_timeout(&mut chunk[filled..], READ_WAIT) {
                    ReadOutcome::Data(length) => filled += length,
                    ReadOutcome::TimedOut => {}
                    ReadOutcome::Closed => {
                        closed = true;
                        break;
                    }
                }
                if self.switch_pending() {
                    break;
                }
            }
            let mut data = &chunk[..filled];

            if let Some(boundary) = self.switch_boundary(data, started) {
                let (before, after) = data.split_at(boundary);
                self.deliver(&mut sink, before);
                sink = self.complete_switch(sink);
                data = after;
            }

            if !started {
                let Some(index) = ts::find_pes_start(data) else {
                    continue;
                };
                data = &data[index..];
                started = true;
                self.set_state("Streaming...");
                info!("Raw consumer is now streaming");
            }

            self.deliver(&mut sink, data);
        }
        sink
    }

    fn deliver(&self, sink: &mut Sink, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        match sink.write(bytes, self.record_buffer_size.load(Ordering::SeqCst)) {
            Ok(()) => {
                self.bytes_streamed
                    .fetch_add(bytes.len() as u64, Ordering::SeqCst);
                if self.stalled.swap(false, Ordering::SeqCst) {
                    self.set_state("Streaming...");
                }
            }
            Err(e) => {
                error!(sink = sink.name(), error = %e, "Raw consumer write failed");
                self.fail(format!("ERROR: {e}"));
            }
        }
    }

    fn switch_pending(&self) -> bool {
        self.switch.lock().request.is_some()
    }

    /// Where in `data` a pending switch should happen, if it should happen now.
    fn switch_boundary(&self, data: &[u8], started: bool) -> Option<usize> {
        let slot = self.switch.lock();
        let request = slot.request.as_ref()?;
        if !started {
            return Some(0);
        }

        let timed_out = request.requested_at.elapsed() >= self.config.switch_boundary_timeout();
        ts::find_access_unit_start(data)
            .or_else(|| timed_out.then(|| ts::find_split_boundary(data)).flatten())
            .or_else(|| (timed_out && data.is_empty()).then_some(0))
    }

    fn complete_switch(&self, sink: Sink) -> Sink {
        let Some(request) = self.switch.lock().request.take() else {
            return sink;
        };

        let (sink, switched) = self.perform_switch(sink, request);
        if !switched {
            self.fail("ERROR: Failed to SWITCH...");
        }

        let mut slot = self.switch.lock();
        slot.outcome = Some(switched);
        self.switched.notify_all();
        sink
    }

    fn perform_switch(&self, sink: Sink, request: SwitchRequest) -> (Sink, bool) {
        let SwitchRequest {
            target,
            buffer_size,
            prepared,
            ..
        } = request;

        match (sink, &target) {
            (
                Sink::Upload(mut session),
                SinkTarget::Upload {
                    filename,
                    upload_id,
                    server,
                },
            ) if session.server() == Some(*server) => {
                let result = if session.is_remux_enabled() {
                    session.switch_remux(filename, *upload_id)
                } else {
                    session.switch_upload(filename, *upload_id)
                };
                match result {
                    Ok(true) => {
                        self.switched_to(target, buffer_size);
                        (Sink::Upload(session), true)
                    }
                    Ok(false) => {
                        error!(filename = filename.as_str(), upload_id, "Media server refused the SWITCH");
                        (Sink::Upload(session), false)
                    }
                    Err(e) => {
                        error!(error = %e, "SWITCH on the media server connection failed");
                        (Sink::Upload(session), false)
                    }
                }
            }
            (old, _) => {
                let next = match (prepared, &target) {
                    (Some(file), _) => Ok(Some(Sink::File(file))),
                    (None, SinkTarget::File { path }) => FileSink::create(path).map(|f| Some(Sink::File(f))),
                    (
                        None,
                        SinkTarget::Upload {
                            filename,
                            upload_id,
                            server,
                        },
                    ) => self.start_upload_sink(filename, *upload_id, *server),
                };
                match next {
                    Ok(Some(next)) => {
                        old.close();
                        self.switched_to(target, buffer_size);
                        (next, true)
                    }
                    Ok(None) => {
                        error!(%target, "Media server refused the new upload");
                        (old, false)
                    }
                    Err(e) => {
                        error!(%target, error = %e, "Unable to open the switch target");
                        (old, false)
                    }
                }
            }
        }
    }

    fn switched_to(&self, target: SinkTarget, buffer_size: u64) {
        info!(%target, buffer_size, "SWITCH was successful");
        *self.target.lock() = Some(target);
        self.record_buffer_size.store(buffer_size, Ordering::SeqCst);
        self.stalled.store(false, Ordering::SeqCst);
        self.set_state("Streaming...");
    }

    fn finish(&self) {
        self.set_state("Stopped.");
        self.stalled.store(true, Ordering::SeqCst);
        {
            let _slot = self.switch.lock();
            self.running.store(false, Ordering::SeqCst);
            self.stop_requested.store(false, Ordering::SeqCst);
        }
        self.switched.notify_all();
        info!("Raw consumer thread has stopped");
    }
}

impl Consumer for RawConsumer {
    fn run(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Raw consumer is already running");
            return;
        }
        self.stalled.store(false, Ordering::SeqCst);
        self.set_state("Waiting for first bytes...");
        if self.buffer.is_closed() {
            self.buffer.clear();
        }
        info!("Raw consumer thread is now running");

        if let Some(sink) = self.open_sink() {
            let sink = self.stream(sink);
            sink.close();
        }

        debug!(
            pending = self.buffer.readable_len(),
            lost = self.buffer.bytes_lost(),
            "Raw consumer buffer at stop"
        );
        self.finish();
    }

    fn write(&self, bytes: &[u8]) {
        self.buffer.write(bytes);
    }

    fn set_record_buffer_size(&self, size: u64) {
        self.record_buffer_size.store(size, Ordering::SeqCst);
    }

    fn can_switch(&self) -> bool {
        true
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stop_consumer(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.buffer.close();
    }

    fn consume_to_null(&self, enabled: bool) {
        self.null_output.store(enabled, Ordering::SeqCst);
        if enabled && self.buffer.is_closed() {
            self.buffer.clear();
        }
    }

    fn bytes_streamed(&self) -> u64 {
        self.bytes_streamed.load(Ordering::SeqCst)
    }

    fn accepts_upload_id(&self) -> bool {
        self.config.accepts_upload_id
    }

    fn accepts_filename(&self) -> bool {
        true
    }

    fn set_encoding_quality(&self, quality: &str) {
        *self.quality.lock() = quality.to_string();
    }

    fn encoding_quality(&self) -> String {
        self.quality.lock().clone()
    }

    fn consume_to(&self, target: SinkTarget) -> bool {
        if self.is_running() {
            warn!(%target, "Cannot change the target of a running consumer, use a switch");
            return false;
        }

        let prepared = match &target {
            SinkTarget::File { path } => match FileSink::create(path) {
                Ok(file) => Some(file),
                Err(e) => {
                    error!(error = %e, "Unable to create the recording file");
                    return false;
                }
            },
            SinkTarget::Upload { .. } => None,
        };

        *self.prepared.lock() = prepared;
        *self.target.lock() = Some(target);
        if self.buffer.is_closed() {
            self.buffer.clear();
        }
        true
    }

    fn switch_to(&self, target: SinkTarget, buffer_size: u64) -> bool {
        if !self.is_running() {
            warn!(%target, "Cannot switch a consumer that is not running");
            return false;
        }

        let prepared = match &target {
            SinkTarget::File { path } => match FileSink::create(path) {
                Ok(file) => Some(file),
                Err(e) => {
                    error!(error = %e, "Unable to create the switch file");
                    return false;
                }
            },
            SinkTarget::Upload { .. } => None,
        };

        let mut slot = self.switch.lock();
        if slot.busy {
            warn!(%target, "A switch is already in progress");
            return false;
        }
        info!(%target, "Waiting for the consumer to switch");
        slot.busy = true;
        slot.outcome = None;
        slot.request = Some(SwitchRequest {
            target,
            buffer_size,
            prepared,
            requested_at: Instant::now(),
        });

        let wait = self.config.switch_wait();
        while slot.outcome.is_none() && self.is_running() {
            self.switched.wait_for(&mut slot, wait);
        }

        let outcome = slot.outcome.take().unwrap_or(false);
        slot.request = None;
        slot.busy = false;
        outcome
    }

    fn target(&self) -> Option<SinkTarget> {
        self.target.lock().clone()
    }

    fn set_program(&self, program: i32) {
        self.program.store(program, Ordering::SeqCst);
    }

    fn program(&self) -> i32 {
        self.program.load(Ordering::SeqCst)
    }

    fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }

    fn state_message(&self) -> String {
        self.state_message.lock().clone()
    }
}
