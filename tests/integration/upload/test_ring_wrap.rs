//! Ring-buffered uploads over a loopback media server.

use dct_capture::config::UploadConfig;
use dct_capture::upload::UploadSession;

use crate::common::{FakeMediaServer, ReceivedWrite};

#[test]
fn test_write_crossing_limit_wraps_to_zero() {
    let server = FakeMediaServer::start();
    let mut session = UploadSession::new(UploadConfig::default());
    assert!(session.start_upload(server.addr(), "ring.ts", 3).unwrap());

    session.set_auto_offset(900);
    let data: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
    session.upload_auto_buffered(1000, &data).unwrap();
    assert_eq!(session.auto_offset(), 100);

    // SIZE is answered only after both blocks were read.
    assert_eq!(session.size().unwrap(), 200);
    assert_eq!(
        server.writes(),
        vec![
            ReceivedWrite {
                offset: 900,
                bytes: data[..100].to_vec(),
            },
            ReceivedWrite {
                offset: 0,
                bytes: data[100..].to_vec(),
            },
        ]
    );
}

#[test]
fn test_write_ending_on_limit_wraps_next_write() {
    let server = FakeMediaServer::start();
    let mut session = UploadSession::new(UploadConfig::default());
    assert!(session.start_upload(server.addr(), "ring.ts", 3).unwrap());

    session.upload_auto_buffered(1000, &[1u8; 1000]).unwrap();
    assert_eq!(session.auto_offset(), 1000);
    session.upload_auto_buffered(1000, &[2u8; 10]).unwrap();
    assert_eq!(session.auto_offset(), 10);

    session.size().unwrap();
    let offsets: Vec<(u64, usize)> = server
        .writes()
        .iter()
        .map(|write| (write.offset, write.bytes.len()))
        .collect();
    assert_eq!(offsets, [(0, 1000), (0, 10)]);
}

#[test]
fn test_zero_limit_appends() {
    let server = FakeMediaServer::start();
    let mut session = UploadSession::new(UploadConfig::default());
    assert!(session.start_upload(server.addr(), "linear.ts", 4).unwrap());

    session.upload_auto_buffered(0, &[0u8; 700]).unwrap();
    session.upload_auto_buffered(0, &[0u8; 700]).unwrap();
    assert_eq!(session.auto_offset(), 1400);

    session.end_upload(true).unwrap();
    assert!(server.wait_for_command("QUIT"));
    let commands = server.commands();
    assert_eq!(
        commands,
        ["WRITEOPEN linear.ts 4", "WRITE 0 700", "WRITE 700 700", "CLOSE", "QUIT"]
    );
}
