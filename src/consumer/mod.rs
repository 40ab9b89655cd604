//! # Consumers
//!
//! A consumer drains what its producer delivers into a recording sink: a
//! local file, an upload to the DVR media server, or nowhere at all.
//!
//! Switching is all-or-nothing. A consumer that reports
//! [`Consumer::can_switch`] supports switching to both file and upload
//! targets, and once [`Consumer::switch_to`] returns `true` every later byte
//! goes to the new target.

pub mod raw;
pub mod sink;

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

pub use raw::RawConsumer;
pub use sink::{FileSink, Sink};

/// A recording destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkTarget {
    File {
        path: PathBuf,
    },
    /// A file owned by the media server, written through an upload session.
    Upload {
        filename: String,
        upload_id: i32,
        server: SocketAddr,
    },
}

impl SinkTarget {
    /// The file name the DVR knows this recording by.
    pub fn filename(&self) -> String {
        match self {
            Self::File { path } => path.display().to_string(),
            Self::Upload { filename, .. } => filename.clone(),
        }
    }

    pub fn upload_id(&self) -> Option<i32> {
        match self {
            Self::Upload { upload_id, .. } => Some(*upload_id),
            Self::File { .. } => None,
        }
    }
}

impl fmt::Display for SinkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File { path } => write!(f, "file {}", path.display()),
            Self::Upload {
                filename,
                upload_id,
                server,
            } => write!(f, "upload {filename} ({upload_id}) via {server}"),
        }
    }
}

pub trait Consumer: Send + Sync {
    /// Drains into the sink until stopped. Blocks the calling thread.
    fn run(&self);

    /// Called by the producer thread with newly received bytes. Never blocks.
    fn write(&self, bytes: &[u8]);

    /// Turns the sink into a ring of `size` bytes. Zero disables wrapping.
    fn set_record_buffer_size(&self, size: u64);

    fn can_switch(&self) -> bool;

    fn is_running(&self) -> bool;

    /// Asks the run loop to end. Does not wait.
    fn stop_consumer(&self);

    /// Counts and drops bytes instead of recording them.
    fn consume_to_null(&self, enabled: bool);

    /// Bytes delivered to sinks since the counter was last reset by its owner.
    fn bytes_streamed(&self) -> u64;

    fn accepts_upload_id(&self) -> bool;

    fn accepts_filename(&self) -> bool;

    fn set_encoding_quality(&self, quality: &str);

    fn encoding_quality(&self) -> String;

    /// Sets the target for the next run. Rejected while running.
    fn consume_to(&self, target: SinkTarget) -> bool;

    /// Moves a running consumer to `target` at a clean packet boundary.
    ///
    /// Blocks until the consumer thread has switched, failed, or stopped.
    fn switch_to(&self, target: SinkTarget, buffer_size: u64) -> bool;

    fn target(&self) -> Option<SinkTarget>;

    fn set_program(&self, program: i32);

    fn program(&self) -> i32;

    fn is_stalled(&self) -> bool;

    fn state_message(&self) -> String;

    fn consume_to_filename(&self, path: PathBuf) -> bool {
        self.consume_to(SinkTarget::File { path })
    }

    fn consume_to_upload_id(&self, filename: &str, upload_id: i32, server: SocketAddr) -> bool {
        self.consume_to(SinkTarget::Upload {
            filename: filename.to_string(),
            upload_id,
            server,
        })
    }

    fn switch_to_filename(&self, path: PathBuf, buffer_size: u64) -> bool {
        self.switch_to(SinkTarget::File { path }, buffer_size)
    }

    fn switch_to_upload_id(
        &self,
        filename: &str,
        upload_id: i32,
        server: SocketAddr,
        buffer_size: u64,
    ) -> bool {
        self.switch_to(
            SinkTarget::Upload {
                filename: filename.to_string(),
                upload_id,
                server,
            },
            buffer_size,
        )
    }
}
