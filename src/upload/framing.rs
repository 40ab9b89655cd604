//! Response line framing for the media server connection.
//!
//! Lines end with CRLF. A bare LF also ends a line but is logged, since a
//! well-behaved server never sends one. A CR that is not followed by LF is
//! ordinary data, and a CR that is the last buffered byte waits for the next
//! read to decide. Bytes left over from one read are kept for the next.

use std::io::{self, Read};
use std::time::{Duration, Instant};

use tracing::debug;

/// Reassembles response lines from arbitrary socket reads.
#[derive(Debug)]
pub struct LineReader {
    pending: Vec<u8>,
    capacity: usize,
    /// When the oldest pending byte arrived
    pending_since: Option<Instant>,
    stale_after: Duration,
}

impl LineReader {
    pub fn new(capacity: usize, stale_after: Duration) -> Self {
        Self {
            pending: Vec::with_capacity(capacity),
            capacity,
            pending_since: None,
            stale_after,
        }
    }

    /// Appends raw bytes as if they had been read from the connection.
    pub fn push(&mut self, bytes: &[u8]) {
        if self.pending.is_empty() && !bytes.is_empty() {
            self.pending_since = Some(Instant::now());
        }
        self.pending.extend_from_slice(bytes);
    }

    /// Removes and returns the next complete line, if one is buffered.
    pub fn next_line(&mut self) -> Option<String> {
        let newline = self.pending.iter().position(|&b| b == b'\n')?;

        let end = if newline > 0 && self.pending[newline - 1] == b'\r' {
            newline - 1
        } else {
            debug!(
                offset = newline,
                "Media server response ended with a bare LF"
            );
            newline
        };

        let line = latin1_decode(&self.pending[..end]);
        self.pending.drain(..=newline);
        self.pending_since = (!self.pending.is_empty()).then(Instant::now);
        Some(line)
    }

    /// Reads from `reader` until a full line is available or `deadline` passes.
    ///
    /// `reader` is expected to have its own read timeout. `Ok(None)` means no
    /// complete line arrived in time; any partial bytes stay buffered.
    ///
    /// # Errors
    ///
    /// Returns `UnexpectedEof` if the peer closed the connection and
    /// `InvalidData` if a line grows past the buffer capacity.
    pub fn read_line<R: Read>(
        &mut self,
        reader: &mut R,
        deadline: Instant,
    ) -> io::Result<Option<String>> {
        self.discard_stale();

        let mut chunk = [0u8; 512];
        loop {
            if let Some(line) = self.next_line() {
                return Ok(Some(line));
            }
            if self.pending.len() >= self.capacity {
                let length = self.pending.len();
                self.clear();
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("response exceeded {length} bytes without a line ending"),
                ));
            }

            match reader.read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "media server closed the connection",
                    ));
                }
                Ok(n) => self.push(&chunk[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn discard_stale(&mut self) {
        let Some(since) = self.pending_since else {
            return;
        };
        if since.elapsed() > self.stale_after {
            debug!(
                bytes = self.pending.len(),
                "Discarding stale partial media server response"
            );
            self.clear();
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.pending_since = None;
    }
}

/// ISO-8859-1 maps every byte to the char with the same code point.
pub fn latin1_decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Encodes to ISO-8859-1, replacing characters outside it with `?`.
pub fn latin1_encode(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}
