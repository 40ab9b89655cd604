//! Response framing when the server's reply arrives in pieces.

use std::io::Cursor;
use std::time::{Duration, Instant};

use dct_capture::config::UploadConfig;
use dct_capture::upload::UploadSession;
use dct_capture::upload::framing::LineReader;

use crate::common::scripted_reply;

const GAP: Duration = Duration::from_millis(50);

fn open(chunks: &'static [&'static [u8]]) -> bool {
    let server = scripted_reply(chunks, GAP);
    let mut session = UploadSession::new(UploadConfig::default());
    session.start_upload(server, "show.ts", 1).unwrap()
}

#[test]
fn test_reply_split_across_reads() {
    assert!(open(&[b"O", b"K\r\n"]));
}

#[test]
fn test_crlf_split_between_reads() {
    assert!(open(&[b"OK\r", b"\n"]));
}

#[test]
fn test_bare_lf_after_refill() {
    assert!(open(&[b"OK", b"\n"]));
}

#[test]
fn test_refused_reply_split_across_reads() {
    assert!(!open(&[b"NON_", b"MEDIA", b"\r\n"]));
}

#[test]
fn test_two_lines_in_one_read_are_kept_apart() {
    let mut lines = LineReader::new(64, Duration::from_secs(30));
    let mut socket = Cursor::new(b"OK\r\n1024 0\r\nTR".to_vec());
    let deadline = Instant::now() + Duration::from_secs(1);

    assert_eq!(lines.read_line(&mut socket, deadline).unwrap().as_deref(), Some("OK"));
    assert_eq!(lines.read_line(&mut socket, deadline).unwrap().as_deref(), Some("1024 0"));
    assert_eq!(lines.pending(), 2);
}
