//! Recording a paced stream through a device and switching files mid-stream.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use dct_capture::capture::{
    CaptureDeviceSession, DeviceIdentity, DeviceSource, PassthroughTuner, StreamOpener,
};
use dct_capture::config::{ConsumerConfig, DctConfig, SessionConfig};
use dct_capture::consumer::SinkTarget;

use crate::common::{PACKET_LEN, PacedSequence, ts, wait_until};

fn device() -> Arc<CaptureDeviceSession> {
    let config = DctConfig {
        session: SessionConfig {
            stop_poll_interval_ms: 20,
            ..SessionConfig::default()
        },
        consumer: ConsumerConfig {
            stream_buffer_size: 1_048_576,
            min_transfer_size: PACKET_LEN,
            max_transfer_size: PACKET_LEN * 16,
            switch_wait_ms: 20,
            switch_boundary_timeout_ms: 2000,
            ..ConsumerConfig::default()
        },
        ..DctConfig::default()
    };
    let opener: StreamOpener = Box::new(|_channel: &str| {
        Ok(Box::new(PacedSequence::new(Duration::from_millis(1))) as Box<dyn std::io::Read + Send>)
    });
    let device = Arc::new(CaptureDeviceSession::new(
        DeviceIdentity::standalone("Switch Tuner", 5),
        Arc::new(config),
        Arc::new(PassthroughTuner),
        DeviceSource::Stream(opener),
    ));
    assert!(device.set_locked(true));
    device
}

fn file(path: &Path) -> SinkTarget {
    SinkTarget::File {
        path: path.to_path_buf(),
    }
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[test]
fn test_switch_splits_cleanly_between_files() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.ts");
    let second = dir.path().join("second.ts");
    let device = device();

    assert!(device.start_encoding("4-1", file(&first), "Great", 0));
    assert!(wait_until(Duration::from_secs(5), || device.recorded_bytes() >= (PACKET_LEN * 40) as u64));

    assert!(device.switch_encoding(file(&second), 0));
    let first_len_at_switch = file_len(&first);
    assert_eq!(device.record_target(), Some(file(&second)));

    assert!(wait_until(Duration::from_secs(5), || file_len(&second) >= (PACKET_LEN * 40) as u64));
    device.stop_device();

    let a = fs::read(&first).unwrap();
    let b = fs::read(&second).unwrap();
    assert_eq!(a.len() as u64, first_len_at_switch, "old file grew after the switch");
    assert_eq!(a.len() % PACKET_LEN, 0);
    assert_eq!(b.len() % PACKET_LEN, 0);
    assert_eq!((a.len() + b.len()) as u64, device.recorded_bytes());

    // The new file opens on a PAT packet.
    assert_eq!(b[0], 0x47);
    assert_eq!(b[1] & 0x5f, 0x40);
    assert_eq!(b[2], 0);

    // Together the two files are exactly the produced sequence, in order.
    let joined: Vec<u8> = a.iter().chain(b.iter()).copied().collect();
    for (index, packet) in joined.chunks(PACKET_LEN).enumerate() {
        assert_eq!(packet, ts::sequence_packet(index as u32).as_slice(), "packet {index}");
    }
}

#[test]
fn test_recorded_bytes_monotonic_across_switch() {
    let dir = tempfile::tempdir().unwrap();
    let device = device();
    assert!(device.start_encoding("4-1", file(&dir.path().join("a.ts")), "", 0));

    let sampling = Arc::new(AtomicBool::new(true));
    let sampler = {
        let device = device.clone();
        let sampling = sampling.clone();
        thread::spawn(move || {
            let mut samples = Vec::new();
            while sampling.load(Ordering::SeqCst) {
                samples.push(device.recorded_bytes());
                thread::sleep(Duration::from_millis(1));
            }
            samples
        })
    };

    assert!(wait_until(Duration::from_secs(5), || device.recorded_bytes() > 0));
    assert!(device.switch_encoding(file(&dir.path().join("b.ts")), 0));
    let at_switch = device.recorded_bytes();
    assert!(wait_until(Duration::from_secs(5), || device.recorded_bytes() > at_switch + 4096));

    sampling.store(false, Ordering::SeqCst);
    let samples = sampler.join().unwrap();
    assert!(samples.len() > 10);
    assert!(samples.windows(2).all(|pair| pair[0] <= pair[1]), "recorded bytes went backwards");

    // Only a new start resets the count.
    device.stop_device();
    let total = device.recorded_bytes();
    assert!(total > at_switch);
    assert!(device.start_encoding("4-1", file(&dir.path().join("c.ts")), "", 0));
    assert!(device.recorded_bytes() < total);
    device.stop_device();
}

#[test]
fn test_ring_recording_stays_within_buffer_size() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ring.ts");
    let device = device();
    let limit = (PACKET_LEN * 25) as u64;

    assert!(device.start_encoding("4-1", file(&path), "", limit));
    assert_eq!(device.record_buffer_size(), limit);
    assert!(wait_until(Duration::from_secs(5), || device.recorded_bytes() > limit * 3));
    device.stop_device();

    assert_eq!(file_len(&path), limit);
}
