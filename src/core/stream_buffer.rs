// # Stream Buffer Module
//
// Bounded byte ring between a producer thread and a consumer thread.
//
// ## Overview
//
// The stream buffer decouples hardware timing from sink timing:
// - **Producer**: a network or stream reader that must never be held up, or
//   datagrams are lost in the kernel
// - **Consumer**: a file or upload writer that may stall for a while
// - **Buffer**: absorbs the difference
//
// ## Architecture
//
// ```text
// ┌─────────────────┐    ┌──────────────────────────┐    ┌─────────────────┐
// │    Producer     │───▶│  ring (capacity bytes)   │───▶│    Consumer     │
// │  (UDP / HTTP)   │    │  overflow (n × capacity) │    │ (file / upload) │
// └─────────────────┘    └──────────────────────────┘    └─────────────────┘
// ```
//
// Writes never block. When the ring is full the bytes go to an overflow queue,
// and when that is full as well they are dropped and counted. Reads block until
// bytes arrive, the timeout passes, or the buffer is closed. Bytes always come
// out in the order they went in.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

/// Result of a blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were copied into the output slice.
    Data(usize),
    /// Nothing arrived before the timeout.
    TimedOut,
    /// The buffer was closed. No more bytes will be returned.
    Closed,
}

#[derive(Debug)]
struct Inner {
    ring: Box<[u8]>,
    read_index: usize,
    len: usize,
    overflow: VecDeque<u8>,
    overflow_warned: bool,
    lost_warned: bool,
    closed: bool,
}

impl Inner {
    fn free(&self) -> usize {
        self.ring.len() - self.len
    }

    /// Copies as much of `bytes` as fits into the ring and returns the count.
    fn push(&mut self, bytes: &[u8]) -> usize {
        let capacity = self.ring.len();
        let count = bytes.len().min(self.free());
        if count == 0 {
            return 0;
        }

        let write_index = (self.read_index + self.len) % capacity;
        let first = count.min(capacity - write_index);
        self.ring[write_index..write_index + first].copy_from_slice(&bytes[..first]);
        self.ring[..count - first].copy_from_slice(&bytes[first..count]);
        self.len += count;
        count
    }

    /// Copies up to `out.len()` bytes out of the ring and returns the count.
    fn pop(&mut self, out: &mut [u8]) -> usize {
        let capacity = self.ring.len();
        let count = out.len().min(self.len);
        if count == 0 {
            return 0;
        }

        let first = count.min(capacity - self.read_index);
        out[..first].copy_from_slice(&self.ring[self.read_index..self.read_index + first]);
        out[first..count].copy_from_slice(&self.ring[..count - first]);
        self.read_index = (self.read_index + count) % capacity;
        self.len -= count;
        count
    }

    /// Moves queued overflow bytes into the ring while there is room.
    fn refill_from_overflow(&mut self) {
        while !self.overflow.is_empty() && self.free() > 0 {
            let (front, _) = self.overflow.as_slices();
            let front = front.to_vec();
            let moved = self.push(&front);
            self.overflow.drain(..moved);
            if moved < front.len() {
                break;
            }
        }

        if self.overflow.is_empty() && self.overflow_warned {
            debug!("Stream buffer overflow queue has drained");
            self.overflow_warned = false;
            self.lost_warned = false;
        }
    }
}

/// Bounded single-writer, single-reader byte buffer.
///
/// The producer calls [`StreamBuffer::write`] from its receive loop. The
/// consumer calls [`StreamBuffer::read_timeout`] from its drain loop. Any
/// thread may call [`StreamBuffer::close`] to release a blocked reader.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use dct_capture::core::stream_buffer::{ReadOutcome, StreamBuffer};
///
/// let buffer = StreamBuffer::new(1024, 4);
/// buffer.write(b"abc");
///
/// let mut out = [0u8; 8];
/// assert_eq!(buffer.read_timeout(&mut out, Duration::from_millis(10)), ReadOutcome::Data(3));
/// assert_eq!(&out[..3], b"abc");
/// ```
#[derive(Debug)]
pub struct StreamBuffer {
    inner: Mutex<Inner>,
    readable: Condvar,
    capacity: usize,
    /// Largest number of bytes the overflow queue may hold
    max_overflow: usize,
    bytes_lost: AtomicU64,
    bytes_written: AtomicU64,
}

impl StreamBuffer {
    /// Creates a buffer of `capacity` bytes whose overflow queue may grow to
    /// `overflow_factor × capacity` bytes.
    pub fn new(capacity: usize, overflow_factor: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                ring: vec![0u8; capacity].into_boxed_slice(),
                read_index: 0,
                len: 0,
                overflow: VecDeque::new(),
                overflow_warned: false,
                lost_warned: false,
                closed: false,
            }),
            readable: Condvar::new(),
            capacity,
            max_overflow: capacity.saturating_mul(overflow_factor),
            bytes_lost: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    /// Appends bytes without blocking.
    ///
    /// Writes to a closed buffer are ignored.
    pub fn write(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }

        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }

        let mut rest = bytes;
        if inner.overflow.is_empty() {
            let pushed = inner.push(rest);
            rest = &rest[pushed..];
        }

        if !rest.is_empty() {
            if inner.overflow.len() + rest.len() <= self.max_overflow {
                if !inner.overflow_warned {
                    warn!(
                        capacity = self.capacity,
                        pending = inner.len,
                        "Stream buffer is full, deferring bytes to the overflow queue"
                    );
                    inner.overflow_warned = true;
                }
                inner.overflow.extend(rest.iter().copied());
            } else {
                if !inner.lost_warned {
                    warn!(
                        overflow = inner.overflow.len(),
                        dropped = rest.len(),
                        "Stream buffer overflow queue is full, dropping bytes"
                    );
                    inner.lost_warned = true;
                }
                self.bytes_lost
                    .fetch_add(rest.len() as u64, Ordering::Relaxed);
                rest = &[];
            }
        }

        let accepted = bytes.len() - rest.len();
        self.bytes_written
            .fetch_add(accepted as u64, Ordering::Relaxed);
        drop(inner);
        self.readable.notify_one();
    }

    /// Blocks until bytes are available, `timeout` passes, or the buffer closes.
    pub fn read_timeout(&self, out: &mut [u8], timeout: Duration) -> ReadOutcome {
        if out.is_empty() {
            return ReadOutcome::Data(0);
        }

        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return ReadOutcome::Closed;
            }
            if inner.len > 0 {
                let count = inner.pop(out);
                inner.refill_from_overflow();
                return ReadOutcome::Data(count);
            }
            if self.readable.wait_until(&mut inner, deadline).timed_out() {
                return if inner.closed {
                    ReadOutcome::Closed
                } else {
                    ReadOutcome::TimedOut
                };
            }
        }
    }

    /// Marks the buffer closed and wakes the reader.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.readable.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Discards all buffered bytes and reopens the buffer.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.read_index = 0;
        inner.len = 0;
        inner.overflow.clear();
        inner.overflow_warned = false;
        inner.lost_warned = false;
        inner.closed = false;
    }

    /// Bytes waiting to be read, including the overflow queue.
    pub fn readable_len(&self) -> usize {
        let inner = self.inner.lock();
        inner.len + inner.overflow.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes dropped because the overflow queue was full.
    pub fn bytes_lost(&self) -> u64 {
        self.bytes_lost.load(Ordering::Relaxed)
    }

    /// Bytes accepted by [`StreamBuffer::write`] since creation.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}
