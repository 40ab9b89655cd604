//! RTSP retry policy and a full RTP recording through a loopback tuner.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dct_capture::capture::{CaptureDeviceSession, DeviceIdentity, DeviceSource, PassthroughTuner};
use dct_capture::config::{ConsumerConfig, DctConfig, RtspConfig, SessionConfig};
use dct_capture::consumer::SinkTarget;
use dct_capture::core::port_pool::PortPool;
use dct_capture::rtsp::{RtspControlSession, RtspPhase, RtspResponse, RtspTransport};
use parking_lot::Mutex;
use url::Url;

use crate::common::{PACKET_LEN, ts, wait_until};

/// Transport whose tuner never answers.
#[derive(Clone, Default)]
struct DeadTuner {
    requests: Arc<Mutex<Vec<String>>>,
}

impl RtspTransport for DeadTuner {
    fn exchange(&mut self, _uri: &Url, request: &str) -> io::Result<RtspResponse> {
        self.requests.lock().push(request.to_string());
        Err(io::ErrorKind::ConnectionRefused.into())
    }
}

fn c_seq(request: &str) -> u32 {
    request
        .lines()
        .find_map(|line| line.strip_prefix("CSeq: "))
        .and_then(|value| value.trim().parse().ok())
        .unwrap()
}

#[test]
fn test_retry_bound_and_elapsed_time() {
    let tuner = DeadTuner::default();
    let config = RtspConfig {
        retry_count: 3,
        retry_wait_ms: 50,
        ..RtspConfig::default()
    };
    let mut session = RtspControlSession::with_transport(config, Box::new(tuner.clone()));
    let uri = Url::parse("rtsp://127.0.0.1:8554/tuner0").unwrap();

    let started = Instant::now();
    assert!(!session.configure_rtp_stream(&uri, 8300));
    let elapsed = started.elapsed();

    let requests = tuner.requests.lock().clone();
    assert_eq!(requests.len(), 4);
    assert!(requests.iter().all(|request| request.starts_with("DESCRIBE ")));
    assert!(elapsed >= Duration::from_millis(150), "retried too fast: {elapsed:?}");

    // Sequence numbers keep counting across attempts.
    let sequence: Vec<u32> = requests.iter().map(|request| c_seq(request)).collect();
    assert!(sequence.windows(2).all(|pair| pair[1] == pair[0] + 1));
    assert_ne!(session.phase(), RtspPhase::Playing);
}

#[test]
fn test_zero_retries_means_one_attempt() {
    let tuner = DeadTuner::default();
    let config = RtspConfig {
        retry_count: 0,
        retry_wait_ms: 1000,
        ..RtspConfig::default()
    };
    let mut session = RtspControlSession::with_transport(config, Box::new(tuner.clone()));
    let uri = Url::parse("rtsp://127.0.0.1/tuner0").unwrap();

    let started = Instant::now();
    assert!(!session.configure_rtp_stream(&uri, 8300));
    assert_eq!(tuner.requests.lock().len(), 1);
    assert!(started.elapsed() < Duration::from_millis(500));
}

/// Loopback RTSP tuner that accepts DESCRIBE/SETUP/PLAY/TEARDOWN, one
/// request per connection, and records every request.
fn spawn_tuner() -> (u16, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let log = requests.clone();

    thread::spawn(move || {
        for socket in listener.incoming() {
            let Ok(socket) = socket else { continue };
            let mut writer = socket.try_clone().unwrap();
            let mut reader = BufReader::new(socket);
            let mut request = String::new();
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" {
                    break;
                }
                request.push_str(&line);
            }
            let sequence = c_seq(&request);
            let method = request.split(' ').next().unwrap_or_default().to_string();
            log.lock().push(request);

            let reply = match method.as_str() {
                "DESCRIBE" => {
                    let body = "v=0\r\ns=tuner0\r\n";
                    format!(
                        "RTSP/1.0 200 OK\r\nCSeq: {sequence}\r\nContent-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{body}",
                        body.len()
                    )
                }
                "SETUP" => format!(
                    "RTSP/1.0 200 OK\r\nCSeq: {sequence}\r\nSession: 0F3A21;timeout=60\r\n\r\n"
                ),
                _ => format!("RTSP/1.0 200 OK\r\nCSeq: {sequence}\r\n\r\n"),
            };
            writer.write_all(reply.as_bytes()).unwrap();
            let mut rest = Vec::new();
            let _ = reader.read_to_end(&mut rest);
        }
    });
    (port, requests)
}

fn client_port(setup: &str) -> u16 {
    let ports = setup.split("client_port=").nth(1).unwrap();
    ports.split('-').next().unwrap().parse().unwrap()
}

/// An RTP datagram carrying seven transport-stream packets.
fn rtp_datagram(sequence: u16, first_packet: u32) -> Vec<u8> {
    let mut datagram = vec![0x80, 33];
    datagram.extend_from_slice(&sequence.to_be_bytes());
    datagram.extend_from_slice(&[0, 0, 0, 0, 0x12, 0x34, 0x56, 0x78]);
    for index in first_packet..first_packet + 7 {
        datagram.extend(ts::sequence_packet(index));
    }
    datagram
}

#[test]
fn test_records_rtp_from_configured_tuner() {
    let (rtsp_port, requests) = spawn_tuner();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rtp.ts");

    let config = DctConfig {
        session: SessionConfig {
            stop_poll_interval_ms: 20,
            ..SessionConfig::default()
        },
        consumer: ConsumerConfig {
            min_transfer_size: PACKET_LEN,
            max_transfer_size: PACKET_LEN * 64,
            ..ConsumerConfig::default()
        },
        ..DctConfig::default()
    };
    let pool = Arc::new(PortPool::new(47_200, 47_300));
    let device = CaptureDeviceSession::new(
        DeviceIdentity::standalone("RTP Tuner", 9),
        Arc::new(config),
        Arc::new(PassthroughTuner),
        DeviceSource::Rtp {
            uri: Url::parse(&format!("rtsp://127.0.0.1:{rtsp_port}/tuner0")).unwrap(),
            remote_ip: None,
        },
    )
    .with_port_pool(pool.clone());

    assert!(device.set_locked(true));
    let target = SinkTarget::File { path: path.clone() };
    assert!(device.start_encoding("11-1", target, "", 0));

    let sent: Vec<String> = requests.lock().clone();
    let methods: Vec<&str> = sent.iter().map(|r| r.split(' ').next().unwrap()).collect();
    assert_eq!(methods, ["DESCRIBE", "SETUP", "PLAY"]);
    assert!(sent.iter().all(|r| r.contains("User-Agent: networkencoder-dct")));
    assert!(sent[2].contains("Session: 0F3A21\r\n"));

    let port = client_port(&sent[1]);
    assert_eq!(pool.stats().0, 1);
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    for datagram in 0..20u16 {
        sender
            .send_to(&rtp_datagram(datagram, u32::from(datagram) * 7), ("127.0.0.1", port))
            .unwrap();
        thread::sleep(Duration::from_millis(2));
    }

    let expected = (20 * 7 * PACKET_LEN) as u64;
    assert!(wait_until(Duration::from_secs(5), || device.recorded_bytes() == expected));

    device.stop_device();
    let methods: Vec<String> = requests
        .lock()
        .iter()
        .map(|r| r.split(' ').next().unwrap().to_string())
        .collect();
    assert_eq!(methods.last().map(String::as_str), Some("TEARDOWN"));
    assert_eq!(pool.stats().0, 0);
    assert_eq!(std::fs::read(&path).unwrap().len() as u64, expected);
}
