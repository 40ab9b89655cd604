//! The raw consumer recording through the upload protocol.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dct_capture::config::{ConsumerConfig, UploadConfig};
use dct_capture::consumer::{Consumer, RawConsumer, SinkTarget};

use crate::common::{FakeMediaServer, PACKET_LEN, ts, wait_until};

fn consumer() -> Arc<RawConsumer> {
    Arc::new(RawConsumer::new(
        ConsumerConfig {
            stream_buffer_size: 262_144,
            min_transfer_size: PACKET_LEN,
            max_transfer_size: PACKET_LEN * 16,
            switch_wait_ms: 20,
            ..ConsumerConfig::default()
        },
        UploadConfig::default(),
    ))
}

fn feed(consumer: &RawConsumer, packets: std::ops::Range<u32>) {
    for index in packets {
        consumer.write(&ts::sequence_packet(index));
        thread::sleep(Duration::from_micros(200));
    }
}

#[test]
fn test_upload_and_switch_on_one_connection() {
    let server = FakeMediaServer::start();
    let consumer = consumer();
    assert!(consumer.consume_to_upload_id("first.ts", 1, server.addr()));

    let worker = {
        let consumer = consumer.clone();
        thread::spawn(move || consumer.run())
    };

    feed(&consumer, 0..40);
    assert!(wait_until(Duration::from_secs(5), || consumer.bytes_streamed() == (40 * PACKET_LEN) as u64));

    // The switch waits for the next PAT in the stream.
    let switcher = {
        let consumer = consumer.clone();
        let addr = server.addr();
        thread::spawn(move || consumer.switch_to_upload_id("second.ts", 2, addr, 0))
    };
    thread::sleep(Duration::from_millis(100));
    assert!(!switcher.is_finished());
    feed(&consumer, 40..80);
    assert!(switcher.join().unwrap());
    assert_eq!(consumer.target().and_then(|t| t.upload_id()), Some(2));

    assert!(wait_until(Duration::from_secs(5), || consumer.bytes_streamed() == (80 * PACKET_LEN) as u64));
    consumer.stop_consumer();
    worker.join().unwrap();
    assert!(server.wait_for_command("QUIT"));

    let commands = server.commands();
    let reopened = commands
        .iter()
        .position(|c| c == "WRITEOPEN second.ts 2")
        .expect("second file was never opened");
    assert_eq!(commands[0], "WRITEOPEN first.ts 1");
    assert_eq!(commands[reopened - 1], "CLOSE");
    assert!(commands[reopened + 1].starts_with("WRITE 0 "));

    // Every byte arrived once, in order, split at the PAT.
    let writes = server.writes();
    let joined: Vec<u8> = writes.iter().flat_map(|w| w.bytes.iter().copied()).collect();
    assert_eq!(joined.len(), 80 * PACKET_LEN);
    for (index, packet) in joined.chunks(PACKET_LEN).enumerate() {
        assert_eq!(packet, ts::sequence_packet(index as u32).as_slice());
    }
    let reset = writes
        .iter()
        .skip(1)
        .find(|w| w.offset == 0)
        .expect("no write starts the second file");
    let opening = &reset.bytes[..PACKET_LEN];
    assert_eq!(opening, ts::pat_packet(ts::counter(opening)).as_slice());
}

#[test]
fn test_unreachable_server_falls_back_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fallback.ts");
    let closed = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let consumer = consumer();
    assert!(consumer.consume_to(SinkTarget::Upload {
        filename: path.display().to_string(),
        upload_id: 5,
        server: closed,
    }));
    let worker = {
        let consumer = consumer.clone();
        thread::spawn(move || consumer.run())
    };

    feed(&consumer, 0..10);
    assert!(wait_until(Duration::from_secs(10), || consumer.bytes_streamed() == (10 * PACKET_LEN) as u64));
    consumer.stop_consumer();
    worker.join().unwrap();

    assert_eq!(std::fs::read(&path).unwrap().len(), 10 * PACKET_LEN);
}
