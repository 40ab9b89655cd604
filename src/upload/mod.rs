//! # Media Server Upload Session
//!
//! Client side of the DVR media server's line protocol. One session owns one
//! TCP connection and talks strict request/response: every command except
//! `WRITE` and `QUIT` is answered by exactly one line before the next command
//! is sent.
//!
//! ```text
//! WRITEOPEN <name> <id>            -> OK | NON_MEDIA
//! WRITE <offset> <length><bytes>   (no answer)
//! SIZE                             -> <bytes> <extra>
//! REMUX_SETUP AUTO <fmt> TRUE|FALSE -> OK
//! REMUX_CONFIG INIT|BUFFER n|FORMAT|SWITCHED -> value
//! REMUX_SWITCH <name> <id>         -> OK
//! CLOSE                            -> OK | NON_MEDIA
//! QUIT                             (connection closed)
//! ```
//!
//! Payload bytes are offset-addressed. [`UploadSession::upload_auto_increment`]
//! and [`UploadSession::upload_auto_buffered`] track the next offset so callers
//! can treat the session as an append-only stream or a fixed-size ring file.

pub mod framing;

use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, bounded};
use tracing::{debug, error, info, trace, warn};

use crate::config::UploadConfig;
use crate::error::{DctError, DctResult, Retryable};
use framing::{LineReader, latin1_encode};

/// Persistent connection to the media server for one recording.
#[derive(Debug)]
pub struct UploadSession {
    config: UploadConfig,
    stream: Option<TcpStream>,
    lines: LineReader,
    server: Option<SocketAddr>,
    filename: Option<String>,
    upload_id: i32,
    auto_offset: u64,
    remux_enabled: bool,
}

impl UploadSession {
    pub fn new(config: UploadConfig) -> Self {
        let lines = LineReader::new(config.message_buffer_size, config.stale_message());
        Self {
            config,
            stream: None,
            lines,
            server: None,
            filename: None,
            upload_id: -1,
            auto_offset: 0,
            remux_enabled: false,
        }
    }

    /// Opens `filename` for writing on `server`, connecting first if needed.
    ///
    /// Returns `Ok(false)` when the server answers anything but `OK`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be made or drops mid-exchange.
    pub fn start_upload(
        &mut self,
        server: SocketAddr,
        filename: &str,
        upload_id: i32,
    ) -> DctResult<bool> {
        if self.server != Some(server) {
            self.disconnect();
        }
        if self.stream.is_none() {
            self.connect(server)?;
        }

        self.filename = Some(filename.to_string());
        self.upload_id = upload_id;
        self.auto_offset = 0;

        let response = self.post_command(&format!("WRITEOPEN {filename} {upload_id}"))?;
        match response.as_str() {
            "OK" => Ok(true),
            "NON_MEDIA" => {
                error!(
                    filename,
                    upload_id, "Media server refused the upload because the file is not media"
                );
                Ok(false)
            }
            other => {
                warn!(filename, upload_id, response = other, "Unexpected WRITEOPEN response");
                Ok(false)
            }
        }
    }

    /// Asks the server to remux the uploaded stream into `format`.
    pub fn setup_remux(&mut self, format: &str, is_tv: bool) -> DctResult<bool> {
        let flag = if is_tv { "TRUE" } else { "FALSE" };
        let accepted = self.post_command(&format!("REMUX_SETUP AUTO {format} {flag}"))? == "OK";
        self.remux_enabled = accepted;
        Ok(accepted)
    }

    pub fn is_remux_initialized(&mut self) -> DctResult<bool> {
        Ok(self.post_command("REMUX_CONFIG INIT")? == "TRUE")
    }

    pub fn set_remux_buffer(&mut self, buffer_size: u64) -> DctResult<bool> {
        Ok(self.post_command(&format!("REMUX_CONFIG BUFFER {buffer_size}"))? == "TRUE")
    }

    pub fn remux_format(&mut self) -> DctResult<String> {
        self.post_command("REMUX_CONFIG FORMAT")
    }

    pub fn is_switched(&mut self) -> DctResult<bool> {
        Ok(self.post_command("REMUX_CONFIG SWITCHED")? == "TRUE")
    }

    pub fn is_remux_enabled(&self) -> bool {
        self.remux_enabled
    }

    /// Switches a remuxing upload to a new file without closing the connection.
    pub fn switch_remux(&mut self, filename: &str, upload_id: i32) -> DctResult<bool> {
        self.auto_offset = 0;
        let accepted =
            self.post_command(&format!("REMUX_SWITCH {filename} {upload_id}"))? == "OK";
        if accepted {
            self.filename = Some(filename.to_string());
            self.upload_id = upload_id;
        }
        Ok(accepted)
    }

    /// Closes the current file and opens another on the same connection.
    ///
    /// If the connection is gone, the target is remembered and a fresh
    /// connection is attempted once.
    pub fn switch_upload(&mut self, filename: &str, upload_id: i32) -> DctResult<bool> {
        let server = self
            .server
            .ok_or_else(|| DctError::state("disconnected", "switch_upload", "no server address"))?;

        if let Err(e) = self.end_upload(false) {
            debug!(error = %e, "CLOSE failed before switching, reconnecting");
            self.disconnect();
        }

        match self.start_upload(server, filename, upload_id) {
            Ok(started) => Ok(started),
            Err(e) => {
                warn!(error = %e, filename, upload_id, "Switch lost the media server connection");
                self.disconnect();
                self.server = Some(server);
                self.filename = Some(filename.to_string());
                self.upload_id = upload_id;
                self.start_upload(server, filename, upload_id)
            }
        }
    }

    /// Size of the remote file as reported by the server.
    pub fn size(&mut self) -> DctResult<u64> {
        let response = self.post_command("SIZE")?;
        let number = response
            .rfind(' ')
            .map_or(response.as_str(), |index| &response[..index]);
        number
            .trim()
            .parse()
            .map_err(|_| DctError::protocol("SIZE", format!("unparsable response '{response}'")))
    }

    /// Writes `bytes` at `offset` of the remote file.
    ///
    /// On a connection failure the connection is re-established once, the
    /// current file is reopened, and the block is sent again.
    pub fn upload(&mut self, offset: u64, bytes: &[u8]) -> DctResult<()> {
        match self.write_block(offset, bytes) {
            Ok(()) => Ok(()),
            Err(e) if !e.is_retryable() => Err(e),
            Err(e) => {
                warn!(error = %e, offset, "Media server write failed, reconnecting");
                self.reopen()?;
                self.write_block(offset, bytes)
            }
        }
    }

    pub fn upload_auto_increment(&mut self, bytes: &[u8]) -> DctResult<()> {
        self.upload(self.auto_offset, bytes)
    }

    /// Writes `bytes` as if the remote file were a ring of `limit` bytes.
    ///
    /// A write that would pass `limit` is split: the first part fills up to
    /// `limit` and the rest continues at offset 0.
    pub fn upload_auto_buffered(&mut self, limit: u64, bytes: &[u8]) -> DctResult<()> {
        if limit == 0 {
            return self.upload_auto_increment(bytes);
        }

        let mut rest = bytes;
        while !rest.is_empty() {
            let room = limit.saturating_sub(self.auto_offset);
            if room == 0 {
                self.auto_offset = 0;
                continue;
            }
            let take = rest.len().min(usize::try_from(room).unwrap_or(usize::MAX));
            self.upload(self.auto_offset, &rest[..take])?;
            rest = &rest[take..];
        }
        Ok(())
    }

    /// Sends `CLOSE` and, when `disconnect` is set, `QUIT` and closes the socket.
    ///
    /// The answer to `CLOSE` may take up to `close_watchdog_ms`. A watchdog
    /// shuts the socket down at that bound so a dead server cannot hang this
    /// call.
    pub fn end_upload(&mut self, disconnect: bool) -> DctResult<()> {
        let Some(stream) = self.stream.as_ref() else {
            self.forget_file();
            return Ok(());
        };

        let watchdog_stream = stream.try_clone().map_err(|e| DctError::io("clone socket", e))?;
        let watchdog_after = self.config.close_watchdog();
        let (cancel, cancelled) = bounded::<()>(1);
        let watchdog = thread::Builder::new()
            .name("UploadCloseWatchdog".to_string())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(watchdog_after) {
                    warn!("Media server did not answer CLOSE, shutting the socket down");
                    if let Err(e) = watchdog_stream.shutdown(Shutdown::Both) {
                        debug!(error = %e, "Socket was already closed");
                    }
                }
            })
            .map_err(|e| DctError::io("spawn close watchdog", e))?;

        let response = self
            .send_command("CLOSE")
            .and_then(|()| self.wait_for_message(watchdog_after))
            .map_err(|e| e.with_operation("CLOSE"));
        drop(cancel);
        if watchdog.join().is_err() {
            warn!("Close watchdog thread panicked");
        }

        let result = match response {
            Ok(line) => {
                debug!(response = line.as_str(), "Upload closed");
                Ok(())
            }
            Err(e) => {
                self.disconnect();
                Err(e)
            }
        };

        if disconnect && self.stream.is_some() {
            if let Err(e) = self.send_command("QUIT") {
                debug!(error = %e, "Unable to send QUIT");
            }
            self.disconnect();
            self.server = None;
        }
        self.forget_file();
        result
    }

    /// Closes any open file best-effort and forgets the connection.
    pub fn reset(&mut self) {
        if self.stream.is_some() {
            if let Err(e) = self.send_command("CLOSE") {
                debug!(error = %e, "Unable to close the upload gracefully");
            }
        }
        self.disconnect();
        self.server = None;
        self.remux_enabled = false;
        self.forget_file();
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn auto_offset(&self) -> u64 {
        self.auto_offset
    }

    pub fn set_auto_offset(&mut self, offset: u64) {
        self.auto_offset = offset;
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn upload_id(&self) -> i32 {
        self.upload_id
    }

    pub fn server(&self) -> Option<SocketAddr> {
        self.server
    }

    fn connect(&mut self, server: SocketAddr) -> DctResult<()> {
        let stream = TcpStream::connect_timeout(&server, self.config.connect_timeout())
            .map_err(|e| DctError::network(server.to_string(), e.to_string()).retryable())?;
        stream
            .set_read_timeout(Some(self.config.response_timeout()))
            .map_err(|e| DctError::io("set read timeout", e))?;
        let _ = stream.set_nodelay(true);

        debug!(%server, "Connected to media server");
        self.lines.clear();
        self.stream = Some(stream);
        self.server = Some(server);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.lines.clear();
    }

    fn forget_file(&mut self) {
        self.filename = None;
        self.upload_id = -1;
    }

    /// Reconnects and reopens the current file after a failed write.
    fn reopen(&mut self) -> DctResult<()> {
        let server = self
            .server
            .ok_or_else(|| DctError::state("disconnected", "upload", "no server address"))?;
        let filename = self
            .filename
            .clone()
            .ok_or_else(|| DctError::state("idle", "upload", "no file is open"))?;
        let upload_id = self.upload_id;
        let offset = self.auto_offset;

        self.disconnect();
        if !self.start_upload(server, &filename, upload_id)? {
            return Err(DctError::protocol("WRITEOPEN", "reopen after reconnect was refused"));
        }
        self.auto_offset = offset;
        Ok(())
    }

    fn write_block(&mut self, offset: u64, bytes: &[u8]) -> DctResult<()> {
        self.send_command(&format!("WRITE {offset} {}", bytes.len()))?;
        let stream = self.connected()?;
        stream
            .write_all(bytes)
            .and_then(|()| stream.flush())
            .map_err(|e| DctError::io("WRITE payload", e))?;
        self.auto_offset = offset + bytes.len() as u64;
        Ok(())
    }

    fn connected(&mut self) -> DctResult<&mut TcpStream> {
        self.stream.as_mut().ok_or_else(|| {
            DctError::state("disconnected", "send", "not connected to a media server").retryable()
        })
    }

    fn send_command(&mut self, command: &str) -> DctResult<()> {
        if command.starts_with("WRITE ") || command == "SIZE" {
            trace!(command, "Sending to media server");
        } else {
            info!(command, "Sending to media server");
        }

        let mut line = latin1_encode(command);
        line.extend_from_slice(b"\r\n");
        let stream = self.connected()?;
        stream
            .write_all(&line)
            .map_err(|e| DctError::io("send command", e).with_context(command.to_string()))
    }

    /// Waits up to `timeout` for one response line.
    fn wait_for_message(&mut self, timeout: Duration) -> DctResult<String> {
        let deadline = Instant::now() + timeout;
        let Self { stream, lines, .. } = self;
        let stream = stream
            .as_mut()
            .ok_or_else(|| DctError::state("disconnected", "receive", "not connected to a media server"))?;

        match lines.read_line(stream, deadline) {
            Ok(Some(line)) => {
                debug!(response = line.as_str(), "Received from media server");
                Ok(line)
            }
            Ok(None) => Err(DctError::timeout(
                "media server response",
                timeout.as_millis() as u64,
            )),
            Err(e) => Err(DctError::io("receive response", e)),
        }
    }

    fn post_command(&mut self, command: &str) -> DctResult<String> {
        self.send_command(command)?;
        self.wait_for_message(self.config.response_timeout())
            .map_err(|e| e.with_operation(command.to_string()))
    }
}

impl Drop for UploadSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}
