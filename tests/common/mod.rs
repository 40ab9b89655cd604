//! Common test utilities shared by the integration tests
//!
//! Provides transport-stream packet builders, paced stream sources and a
//! loopback media server that speaks enough of the upload protocol to record
//! what a client sent.

#![allow(dead_code)]

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub const PACKET_LEN: usize = 188;

/// Polls `condition` every few milliseconds until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Transport-stream packet builders
pub mod ts {
    use super::PACKET_LEN;

    pub const VIDEO_PID: u16 = 0x100;

    /// A payload-only packet whose payload begins with `counter` and is
    /// otherwise filled with `0xEE`.
    pub fn packet(pid: u16, unit_start: bool, counter: u32) -> Vec<u8> {
        let mut packet = vec![0xEE; PACKET_LEN];
        packet[0] = 0x47;
        packet[1] = ((pid >> 8) as u8 & 0x1f) | if unit_start { 0x40 } else { 0 };
        packet[2] = pid as u8;
        packet[3] = 0x10;
        packet[8..12].copy_from_slice(&counter.to_be_bytes());
        packet
    }

    pub fn pes_packet(counter: u32) -> Vec<u8> {
        let mut packet = packet(VIDEO_PID, true, counter);
        packet[4..8].copy_from_slice(&[0x00, 0x00, 0x01, 0xE0]);
        packet
    }

    pub fn pat_packet(counter: u32) -> Vec<u8> {
        let mut packet = packet(0, true, counter);
        packet[4..8].copy_from_slice(&[0x00, 0x00, 0xB0, 0x0D]);
        packet
    }

    /// Packet `index` of the reference sequence: a PES start first, a PAT
    /// every tenth packet, video payload otherwise.
    pub fn sequence_packet(index: u32) -> Vec<u8> {
        match index {
            0 => pes_packet(index),
            i if i % 10 == 0 => pat_packet(i),
            i => packet(VIDEO_PID, false, i),
        }
    }

    /// Counter stamped into a packet by the builders above.
    pub fn counter(packet: &[u8]) -> u32 {
        u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]])
    }
}

/// Endless reader that delivers the reference sequence one packet per read,
/// pausing `interval` between packets.
pub struct PacedSequence {
    next: u32,
    interval: Duration,
}

impl PacedSequence {
    pub fn new(interval: Duration) -> Self {
        Self { next: 0, interval }
    }
}

impl Read for PacedSequence {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.len() < PACKET_LEN {
            return Ok(0);
        }
        thread::sleep(self.interval);
        let packet = ts::sequence_packet(self.next);
        buf[..PACKET_LEN].copy_from_slice(&packet);
        self.next += 1;
        Ok(PACKET_LEN)
    }
}

/// One `WRITE` block received by the fake media server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedWrite {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct ServerLog {
    commands: Vec<String>,
    writes: Vec<ReceivedWrite>,
}

/// Loopback media server.
///
/// Answers `OK` to every command except `SIZE` (total bytes received) and
/// `REMUX_CONFIG` (`TRUE`). `WRITE` payloads are read and logged but not
/// answered. Accepts any number of connections, one at a time.
pub struct FakeMediaServer {
    addr: SocketAddr,
    log: Arc<Mutex<ServerLog>>,
    stop: Arc<AtomicBool>,
}

impl FakeMediaServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let log = Arc::new(Mutex::new(ServerLog::default()));
        let stop = Arc::new(AtomicBool::new(false));

        let server_log = log.clone();
        let server_stop = stop.clone();
        thread::spawn(move || {
            for socket in listener.incoming() {
                if server_stop.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(socket) = socket else { continue };
                serve(socket, &server_log);
            }
        });

        Self { addr, log, stop }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().commands.clone()
    }

    pub fn writes(&self) -> Vec<ReceivedWrite> {
        self.log.lock().writes.clone()
    }

    /// Waits until `command` has been received.
    pub fn wait_for_command(&self, command: &str) -> bool {
        wait_until(Duration::from_secs(5), || {
            self.commands().iter().any(|received| received == command)
        })
    }
}

impl Drop for FakeMediaServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Wake the accept loop so it sees the flag.
        let _ = std::net::TcpStream::connect(self.addr);
    }
}

fn serve(socket: std::net::TcpStream, log: &Mutex<ServerLog>) {
    let Ok(mut writer) = socket.try_clone() else {
        return;
    };
    let mut reader = BufReader::new(socket);
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            return;
        }
        let line = line.trim_end().to_string();

        if let Some(rest) = line.strip_prefix("WRITE ") {
            let mut parts = rest.split(' ');
            let offset: u64 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
            let length: usize = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
            let mut bytes = vec![0u8; length];
            if reader.read_exact(&mut bytes).is_err() {
                return;
            }
            let mut log = log.lock();
            log.commands.push(line);
            log.writes.push(ReceivedWrite { offset, bytes });
            continue;
        }

        let answer = {
            let mut log = log.lock();
            log.commands.push(line.clone());
            if line == "QUIT" {
                return;
            }
            if line == "SIZE" {
                let total: usize = log.writes.iter().map(|w| w.bytes.len()).sum();
                format!("{total} 0")
            } else if line.starts_with("REMUX_CONFIG") {
                "TRUE".to_string()
            } else {
                "OK".to_string()
            }
        };
        if writer.write_all(format!("{answer}\r\n").as_bytes()).is_err() {
            return;
        }
    }
}

/// Serves exactly one connection: reads one command line, then writes
/// `chunks` with `gap` between them.
pub fn scripted_reply(chunks: &'static [&'static [u8]], gap: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (socket, _) = listener.accept().unwrap();
        let mut writer = socket.try_clone().unwrap();
        let mut reader = BufReader::new(socket);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        for chunk in chunks {
            writer.write_all(chunk).unwrap();
            writer.flush().unwrap();
            thread::sleep(gap);
        }
        // Keep the socket open until the client is done with it.
        let mut rest = Vec::new();
        let _ = reader.read_to_end(&mut rest);
    });
    addr
}
