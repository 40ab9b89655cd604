//! HTTP producer for tuners that serve the transport stream as a GET body.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::blocking::{Client, Response};
use tracing::{debug, error, info, warn};
use url::Url;

use super::{Producer, ProducerKind, ProducerSource, ProducerState};
use crate::config::ProducerConfig;
use crate::consumer::Consumer;
use crate::error::{DctError, DctResult};

#[derive(Debug, Default)]
struct Connection {
    urls: Vec<Url>,
    /// Index of the URL the current response came from
    current: usize,
    response: Option<Response>,
}

pub struct HttpProducer {
    state: ProducerState,
    config: ProducerConfig,
    connection: Mutex<Connection>,
    owner: String,
}

impl HttpProducer {
    pub fn new(config: ProducerConfig, owner: impl Into<String>) -> Self {
        Self {
            state: ProducerState::new(),
            config,
            connection: Mutex::new(Connection::default()),
            owner: owner.into(),
        }
    }

    fn client(&self) -> DctResult<Client> {
        Client::builder()
            .connect_timeout(Duration::from_millis(self.config.http_connect_timeout_ms))
            .timeout(None)
            .build()
            .map_err(|e| DctError::network("http client", e.to_string()))
    }

    /// Tries every URL once, starting at `start`. Returns the index and response
    /// of the first one that answers with a success status.
    fn connect(client: &Client, urls: &[Url], start: usize) -> Option<(usize, Response)> {
        (0..urls.len())
            .map(|offset| (start + offset) % urls.len())
            .find_map(|index| {
                let url = &urls[index];
                match client.get(url.clone()).send().and_then(Response::error_for_status) {
                    Ok(response) => {
                        debug!(url = url.as_str(), "Connected to HTTP stream");
                        Some((index, response))
                    }
                    Err(e) => {
                        warn!(url = url.as_str(), error = %e, "Unable to open HTTP stream");
                        None
                    }
                }
            })
    }

    /// Reconnects after a read failure, rotating URLs until one answers or a stop
    /// is requested.
    fn reconnect(&self, client: &Client, urls: &[Url], after: usize) -> Option<(usize, Response)> {
        while !self.state.stop_requested() {
            if let Some(found) = Self::connect(client, urls, (after + 1) % urls.len()) {
                return Some(found);
            }
            self.state.pause(self.config.http_retry_wait());
        }
        None
    }
}

impl Producer for HttpProducer {
    fn kind(&self) -> ProducerKind {
        ProducerKind::Http
    }

    fn set_consumer(&self, consumer: Arc<dyn Consumer>) -> DctResult<()> {
        self.state.set_consumer(consumer)
    }

    fn bind(&self, source: ProducerSource) -> DctResult<()> {
        self.state.ensure_idle("bind")?;
        let kind = source.kind();
        let ProducerSource::Http { urls } = source else {
            return Err(DctError::validation(
                "source",
                "HTTP producer needs an HTTP source",
                kind.to_string(),
            ));
        };
        if urls.is_empty() {
            return Err(DctError::validation("urls", "at least one URL", "none"));
        }

        let client = self.client()?;
        let (current, response) = Self::connect(&client, &urls, 0).ok_or_else(|| {
            DctError::network(
                urls.iter().map(Url::as_str).collect::<Vec<_>>().join(", "),
                "no URL could be opened",
            )
        })?;

        *self.connection.lock() = Connection {
            urls,
            current,
            response: Some(response),
        };
        Ok(())
    }

    fn run(&self) {
        let Some(consumer) = self.state.consumer() else {
            error!(owner = self.owner.as_str(), "HTTP producer started without a consumer");
            return;
        };
        let (urls, mut current, response) = {
            let mut connection = self.connection.lock();
            (connection.urls.clone(), connection.current, connection.response.take())
        };
        let Some(mut response) = response else {
            error!(owner = self.owner.as_str(), "HTTP producer started without a connection");
            return;
        };
        let client = match self.client() {
            Ok(client) => client,
            Err(e) => {
                error!(error = %e, "Unable to build HTTP client");
                return;
            }
        };

        if !self.state.begin_run() {
            self.state.end_run();
            return;
        }
        info!(owner = self.owner.as_str(), url = urls[current].as_str(), "HTTP producer thread started");

        let mut buffer = vec![0u8; self.config.http_read_buffer.max(1)];
        while !self.state.stop_requested() {
            match response.read(&mut buffer) {
                Ok(0) => {
                    info!(owner = self.owner.as_str(), "HTTP stream ended");
                    break;
                }
                Ok(length) => {
                    self.state.record_packet();
                    consumer.write(&buffer[..length]);
                }
                Err(e) => {
                    warn!(owner = self.owner.as_str(), error = %e, "HTTP read failed, reconnecting");
                    match self.reconnect(&client, &urls, current) {
                        Some((index, fresh)) => {
                            current = index;
                            response = fresh;
                        }
                        None => break,
                    }
                }
            }
        }

        debug!(owner = self.owner.as_str(), reads = self.state.packets(), "HTTP producer thread stopped");
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
