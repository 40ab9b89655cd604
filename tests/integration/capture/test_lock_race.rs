//! Concurrent lock attempts on one device.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use dct_capture::capture::{
    CaptureDeviceSession, DeviceIdentity, DeviceSource, LockState, PassthroughTuner, ScanChannel,
};
use dct_capture::config::DctConfig;

fn device() -> Arc<CaptureDeviceSession> {
    Arc::new(CaptureDeviceSession::new(
        DeviceIdentity::standalone("Race Tuner", 42),
        Arc::new(DctConfig::default()),
        Arc::new(PassthroughTuner),
        DeviceSource::Http { urls: Vec::new() },
    ))
}

/// Runs `set_locked(locked)` from `callers` threads released at once and
/// returns each caller's result and how long it took.
fn race(device: &Arc<CaptureDeviceSession>, callers: usize, locked: bool) -> Vec<(bool, Duration)> {
    let barrier = Arc::new(Barrier::new(callers));
    let handles: Vec<_> = (0..callers)
        .map(|_| {
            let device = device.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let started = Instant::now();
                let won = device.set_locked(locked);
                (won, started.elapsed())
            })
        })
        .collect();
    handles.into_iter().map(|handle| handle.join().unwrap()).collect()
}

#[test]
fn test_exactly_one_caller_wins_the_lock() {
    for _ in 0..20 {
        let device = device();
        let results = race(&device, 16, true);

        let winners = results.iter().filter(|(won, _)| *won).count();
        assert_eq!(winners, 1);
        assert!(results.iter().all(|(_, took)| *took < Duration::from_secs(1)));
        assert_eq!(device.lock_state(), LockState::Locked);
    }
}

#[test]
fn test_exactly_one_caller_releases_the_lock() {
    let device = device();
    assert!(device.set_locked(true));

    let results = race(&device, 8, false);
    assert_eq!(results.iter().filter(|(won, _)| *won).count(), 1);
    assert_eq!(device.lock_state(), LockState::Idle);
}

#[test]
fn test_lock_preempts_a_running_scan_quickly() {
    let device = Arc::new(CaptureDeviceSession::new(
        DeviceIdentity::standalone("Scan Tuner", 43),
        Arc::new(DctConfig::default()),
        Arc::new(PassthroughTuner),
        // Nothing ever arrives, so the scan would wait its full period.
        DeviceSource::Stream(Box::new(|_channel: &str| {
            Ok(Box::new(std::io::empty()) as Box<dyn std::io::Read + Send>)
        })),
    ));

    let scanner = {
        let device = device.clone();
        thread::spawn(move || {
            let mut scan = ScanChannel::new("7-1");
            let completed = device.channel_info_offline(&mut scan, false);
            (completed, scan)
        })
    };

    thread::sleep(Duration::from_millis(300));
    let started = Instant::now();
    assert!(device.set_locked(true));
    assert!(started.elapsed() < Duration::from_secs(2));

    let (completed, scan) = scanner.join().unwrap();
    assert!(!completed);
    assert_eq!(scan, ScanChannel::new("7-1"));
    assert_eq!(device.lock_state(), LockState::Locked);
    device.stop_device();
}
