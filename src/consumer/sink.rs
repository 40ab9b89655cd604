//! Recording sinks a consumer writes into.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{DctError, DctResult};
use crate::upload::UploadSession;

/// A local recording file, optionally used as a fixed-size ring.
#[derive(Debug)]
pub struct FileSink {
    file: File,
    path: PathBuf,
    position: u64,
}

impl FileSink {
    /// Creates or truncates `path`.
    pub fn create(path: impl AsRef<Path>) -> DctResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| DctError::io("create recording file", e).with_context(path.display().to_string()))?;
        Ok(Self {
            file,
            path,
            position: 0,
        })
    }

    /// Writes `bytes` at the current position.
    ///
    /// With a nonzero `ring_limit` the file never grows past that size: a
    /// write that would cross it is split and the remainder goes to offset 0.
    pub fn write(&mut self, bytes: &[u8], ring_limit: u64) -> DctResult<()> {
        let mut rest = bytes;
        while !rest.is_empty() {
            if ring_limit > 0 && self.position >= ring_limit {
                self.seek_start()?;
            }
            let take = if ring_limit > 0 {
                let room = ring_limit - self.position;
                rest.len().min(usize::try_from(room).unwrap_or(usize::MAX))
            } else {
                rest.len()
            };

            self.file
                .write_all(&rest[..take])
                .map_err(|e| DctError::io("write recording file", e).with_context(self.path.display().to_string()))?;
            self.position += take as u64;
            rest = &rest[take..];
        }
        Ok(())
    }

    fn seek_start(&mut self) -> DctResult<()> {
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| DctError::io("rewind recording file", e))?;
        self.position = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    fn close(mut self) {
        if let Err(e) = self.file.flush() {
            warn!(path = %self.path.display(), error = %e, "Unable to flush recording file");
        }
    }
}

/// Where a running consumer is currently writing.
#[derive(Debug)]
pub enum Sink {
    File(FileSink),
    Upload(Box<UploadSession>),
    /// Bytes are counted and dropped. Used by channel scans.
    Null,
}

impl Sink {
    pub fn write(&mut self, bytes: &[u8], ring_limit: u64) -> DctResult<()> {
        match self {
            Self::File(file) => file.write(bytes, ring_limit),
            Self::Upload(session) if ring_limit > 0 => session.upload_auto_buffered(ring_limit, bytes),
            Self::Upload(session) => session.upload_auto_increment(bytes),
            Self::Null => Ok(()),
        }
    }

    /// Flushes a file or ends the upload and drops the connection.
    pub fn close(self) {
        match self {
            Self::File(file) => file.close(),
            Self::Upload(mut session) => {
                if let Err(e) = session.end_upload(true) {
                    debug!(error = %e, "Upload did not close cleanly");
                }
            }
            Self::Null => {}
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::File(_) => "file",
            Self::Upload(_) => "upload",
            Self::Null => "null",
        }
    }
}
