//! RTP over UDP producer.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::rtp::{self, SequenceTracker};
use super::{Producer, ProducerKind, ProducerSource, ProducerState};
use crate::config::ProducerConfig;
use crate::consumer::Consumer;
use crate::core::port_pool::PortPool;
use crate::error::{DctError, DctResult};

/// Datagram buffer size after the first oversized datagram.
const FIRST_GROWTH: usize = 32_767;
const MAX_DATAGRAM_BUFFER: usize = 5_242_880;

#[derive(Debug)]
struct Binding {
    socket: UdpSocket,
    remote_ip: Option<IpAddr>,
    local_port: u16,
}

pub struct UdpProducer {
    state: ProducerState,
    config: ProducerConfig,
    binding: Mutex<Option<Binding>>,
    /// Port source when the requested port cannot be bound
    port_pool: Option<Arc<PortPool>>,
    owner: String,
}

impl UdpProducer {
    pub fn new(config: ProducerConfig, owner: impl Into<String>) -> Self {
        Self {
            state: ProducerState::new(),
            config,
            binding: Mutex::new(None),
            port_pool: None,
            owner: owner.into(),
        }
    }

    /// Lets `bind` fall back to other ports from `pool`.
    pub fn with_port_pool(mut self, pool: Arc<PortPool>) -> Self {
        self.port_pool = Some(pool);
        self
    }

    fn open_socket(&self, mut port: u16) -> DctResult<UdpSocket> {
        let mut attempts = 0;
        loop {
            let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
            match UdpSocket::bind(address) {
                Ok(socket) => return Ok(socket),
                Err(e) => {
                    let replacement = self
                        .port_pool
                        .as_ref()
                        .filter(|_| attempts < self.config.port_retry_count)
                        .and_then(|pool| pool.replace(port, &self.owner));
                    let Some(next) = replacement else {
                        return Err(DctError::io("bind UDP socket", e)
                            .with_context(format!("port {port}")));
                    };
                    warn!(port, next, error = %e, "Unable to bind RTP port, trying another");
                    attempts += 1;
                    port = next;
                }
            }
        }
    }

    /// Grows the datagram buffer after a datagram filled it completely.
    fn grow(buffer: &mut Vec<u8>) {
        let next = if buffer.len() < FIRST_GROWTH {
            FIRST_GROWTH
        } else {
            (buffer.len() * 2).min(MAX_DATAGRAM_BUFFER)
        };
        if next > buffer.len() {
            warn!(from = buffer.len(), to = next, "Datagram filled the receive buffer, growing it");
            buffer.resize(next, 0);
        }
    }
}

impl Producer for UdpProducer {
    fn kind(&self) -> ProducerKind {
        ProducerKind::Udp
    }

    fn set_consumer(&self, consumer: Arc<dyn Consumer>) -> DctResult<()> {
        self.state.set_consumer(consumer)
    }

    fn bind(&self, source: ProducerSource) -> DctResult<()> {
        self.state.ensure_idle("bind")?;
        let kind = source.kind();
        let ProducerSource::Udp {
            remote_ip,
            local_port,
        } = source
        else {
            return Err(DctError::validation(
                "source",
                "UDP producer needs a UDP source",
                kind.to_string(),
            ));
        };

        let socket = self.open_socket(local_port)?;
        socket
            .set_read_timeout(Some(self.config.udp_read_timeout()))
            .map_err(|e| DctError::io("set UDP read timeout", e))?;
        let local_port = socket
            .local_addr()
            .map_err(|e| DctError::io("read UDP local address", e))?
            .port();

        info!(local_port, remote = ?remote_ip, owner = self.owner.as_str(), "UDP producer bound");
        *self.binding.lock() = Some(Binding {
            socket,
            remote_ip,
            local_port,
        });
        Ok(())
    }

    fn run(&self) {
        let (socket, remote_ip) = {
            let binding = self.binding.lock();
            let Some(binding) = binding.as_ref() else {
                error!(owner = self.owner.as_str(), "UDP producer started without a socket");
                return;
            };
            match binding.socket.try_clone() {
                Ok(socket) => (socket, binding.remote_ip),
                Err(e) => {
                    error!(error = %e, "Unable to clone the UDP socket");
                    return;
                }
            }
        };
        let Some(consumer) = self.state.consumer() else {
            error!(owner = self.owner.as_str(), "UDP producer started without a consumer");
            return;
        };

        if !self.state.begin_run() {
            self.state.end_run();
            return;
        }
        debug!(owner = self.owner.as_str(), "UDP producer thread started");

        let mut buffer = vec![0u8; self.config.udp_receive_buffer];
        let mut sequence = SequenceTracker::default();
        let mut stalled = false;

        while !self.state.stop_requested() {
            match socket.recv_from(&mut buffer) {
                Ok((length, from)) => {
                    if length == buffer.len() {
                        Self::grow(&mut buffer);
                    }
                    if remote_ip.is_some_and(|ip| ip != from.ip()) {
                        continue;
                    }
                    let Some(packet) = rtp::parse(&buffer[..length]) else {
                        continue;
                    };

                    if stalled {
                        info!(owner = self.owner.as_str(), "UDP stream resumed");
                        stalled = false;
                    }
                    let lost = sequence.observe(packet.sequence);
                    if lost > 0 {
                        debug!(lost, sequence = packet.sequence, "RTP packets lost");
                        self.state.record_lost(lost);
                    }
                    self.state.record_packet();
                    consumer.write(&buffer[packet.payload_start..packet.payload_end]);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) =>
                {
                    if !stalled && self.state.is_stalled(self.config.stalled_timeout()) {
                        warn!(
                            owner = self.owner.as_str(),
                            seconds = self.config.stalled_timeout_s,
                            "No UDP packets received, stream looks stalled"
                        );
                        stalled = true;
                    }
                }
                Err(e) => {
                    error!(owner = self.owner.as_str(), error = %e, "UDP receive failed");
                    break;
                }
            }
        }

        debug!(
            owner = self.owner.as_str(),
            packets = self.state.packets(),
            lost = self.state.packets_lost(),
            "UDP producer thread stopped"
        );
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
        self.state.packets_lost()
    }

    fn is_stalled(&self) -> bool {
        self.state.is_stalled(self.config.stalled_timeout())
    }

    fn local_port(&self) -> Option<u16> {
        self.binding.lock().as_ref().map(|binding| binding.local_port)
    }
}
