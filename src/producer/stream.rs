//! Producer over any blocking `Read` source, such as a device node or pipe.

use std::io::{self, Read};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use super::{Producer, ProducerKind, ProducerSource, ProducerState};
use crate::config::ProducerConfig;
use crate::consumer::Consumer;
use crate::error::{DctError, DctResult};

const READ_CHUNK: usize = 65_536;

/// Reads until stopped. EOF only pauses the loop, since capture devices
/// exposed as files report EOF while the tuner is between channels.
pub struct StreamProducer {
    state: ProducerState,
    config: ProducerConfig,
    source: Mutex<Option<Box<dyn Read + Send>>>,
    owner: String,
}

impl StreamProducer {
    pub fn new(config: ProducerConfig, owner: impl Into<String>) -> Self {
        Self {
            state: ProducerState::new(),
            config,
            source: Mutex::new(None),
            owner: owner.into(),
        }
    }
}

impl Producer for StreamProducer {
    fn kind(&self) -> ProducerKind {
        ProducerKind::Stream
    }

    fn set_consumer(&self, consumer: Arc<dyn Consumer>) -> DctResult<()> {
        self.state.set_consumer(consumer)
    }

    fn bind(&self, source: ProducerSource) -> DctResult<()> {
        self.state.ensure_idle("bind")?;
        match source {
            ProducerSource::Stream(reader) => {
                *self.source.lock() = Some(reader);
                Ok(())
            }
            other => Err(DctError::validation(
                "source",
                "stream producer needs a stream source",
                other.kind().to_string(),
            )),
        }
    }

    fn run(&self) {
        let Some(consumer) = self.state.consumer() else {
            error!(owner = self.owner.as_str(), "Stream producer started without a consumer");
            return;
        };
        let Some(mut reader) = self.source.lock().take() else {
            error!(owner = self.owner.as_str(), "Stream producer started without a source");
            return;
        };

        if !self.state.begin_run() {
            self.state.end_run();
            return;
        }
        debug!(owner = self.owner.as_str(), "Stream producer thread started");

        let mut buffer = vec![0u8; READ_CHUNK];
        let mut at_eof = false;
        while !self.state.stop_requested() {
            match reader.read(&mut buffer) {
                Ok(0) => {
                    if !at_eof {
                        info!(owner = self.owner.as_str(), "Stream ended, waiting for more data");
                        at_eof = true;
                    }
                    self.state.pause(self.config.stream_eof_wait());
                }
                Ok(length) => {
                    if at_eof {
                        info!(owner = self.owner.as_str(), "Stream resumed");
                        at_eof = false;
                    }
                    self.state.record_packet();
                    consumer.write(&buffer[..length]);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(owner = self.owner.as_str(), error = %e, "Stream read failed");
                    break;
                }
            }
        }

        // Hand the source back so a restart can continue where this run stopped.
        *self.source.lock() = Some(reader);
        debug!(owner = self.owner.as_str(), reads = self.state.packets(), "Stream producer thread stopped");
        self.state.end_run();
    }

    fn stop_producing(&self) {
        self.state.request_stop();
    }

    fn is_running(&self) -> bool {
        self.state.is_running()
    }

    fn packets(&self) -> u64 {
        self.state.packets()
    }

    fn packets_lost(&self) -> u64 {
        0
    }

    fn is_stalled(&self) -> bool {
        self.state.is_stalled(self.config.stalled_timeout())
    }
}
