//! # RTSP Control Session
//!
//! Points a network tuner's RTP output at a local UDP port.
//!
//! ```text
//! New ─▶ Describing ─▶ SettingUp ─▶ Playing ─▶ TornDown
//!            ▲                 │
//!            └── retry ────────┘ (any step fails)
//! ```
//!
//! DESCRIBE, SETUP and PLAY run as one attempt. A failure at any step restarts
//! the whole attempt from DESCRIBE after `retry_wait_ms`, up to `retry_count`
//! extra times, because tuners are known to reject requests under load. The
//! `CSeq` counter keeps counting across attempts and is never reused.

pub mod transport;

use std::thread;

use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::RtspConfig;
use crate::error::{DctError, DctResult};
pub use transport::{DEFAULT_RTSP_PORT, RtspResponse, RtspTransport, TcpRtspTransport};

/// Where the control session is in the setup/teardown cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspPhase {
    New,
    Describing,
    SettingUp,
    Playing,
    TornDown,
}

pub struct RtspControlSession {
    config: RtspConfig,
    transport: Box<dyn RtspTransport>,
    c_seq: u32,
    session_token: Option<String>,
    uri: Option<Url>,
    local_port: u16,
    phase: RtspPhase,
}

impl std::fmt::Debug for RtspControlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtspControlSession")
            .field("c_seq", &self.c_seq)
            .field("session_token", &self.session_token)
            .field("uri", &self.uri.as_ref().map(Url::as_str))
            .field("local_port", &self.local_port)
            .field("phase", &self.phase)
            .finish()
    }
}

impl RtspControlSession {
    /// Creates a session that talks to tuners over plain TCP.
    pub fn new(config: RtspConfig) -> Self {
        let transport = TcpRtspTransport::new(
            std::time::Duration::from_millis(config.connect_timeout_ms),
            std::time::Duration::from_millis(config.read_timeout_ms),
        );
        Self::with_transport(config, Box::new(transport))
    }

    pub fn with_transport(config: RtspConfig, transport: Box<dyn RtspTransport>) -> Self {
        Self {
            config,
            transport,
            c_seq: 1,
            session_token: None,
            uri: None,
            local_port: 0,
            phase: RtspPhase::New,
        }
    }

    /// Asks the tuner at `uri` to stream RTP to `local_port` and its RTCP pair.
    ///
    /// Returns `false` only after every attempt has failed.
    pub fn configure_rtp_stream(&mut self, uri: &Url, local_port: u16) -> bool {
        self.uri = Some(uri.clone());
        self.local_port = local_port;

        let attempts = self.config.retry_count + 1;
        for attempt in 1..=attempts {
            if attempt > 1 {
                thread::sleep(self.config.retry_wait());
            }

            self.session_token = None;
            match self.attempt(uri) {
                Ok(()) => {
                    info!(uri = uri.as_str(), local_port, attempt, "RTSP stream configured");
                    return true;
                }
                Err(e) => {
                    debug!(uri = uri.as_str(), attempt, phase = ?self.phase, error = %e, "RTSP attempt failed");
                }
            }
        }

        error!(
            uri = uri.as_str(),
            "Failed to configure RTSP after {} attempts", attempts
        );
        false
    }

    /// Sends TEARDOWN for the current session.
    ///
    /// Succeeds without sending anything when there is no session. A 454
    /// response means the tuner already dropped it, which also counts as
    /// success. Teardown is never retried.
    pub fn stop_rtp_stream(&mut self) -> bool {
        let (Some(uri), Some(token)) = (self.uri.clone(), self.session_token.clone()) else {
            self.phase = RtspPhase::TornDown;
            return true;
        };

        let request = self.request("TEARDOWN", &uri, &[format!("Session: {token}")]);
        let stopped = match self.transport.exchange(&uri, &request) {
            Ok(response) if response.is_success() || response.status == 454 => {
                debug!(uri = uri.as_str(), status = response.status, "RTSP session torn down");
                true
            }
            Ok(response) => {
                warn!(uri = uri.as_str(), status = response.status, reason = response.reason.as_str(), "RTSP TEARDOWN rejected");
                false
            }
            Err(e) => {
                warn!(uri = uri.as_str(), error = %e, "RTSP TEARDOWN failed");
                false
            }
        };

        self.session_token = None;
        self.local_port = 0;
        self.phase = RtspPhase::TornDown;
        stopped
    }

    pub fn phase(&self) -> RtspPhase {
        self.phase
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    /// The sequence number the next request will carry.
    pub fn c_seq(&self) -> u32 {
        self.c_seq
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    fn attempt(&mut self, uri: &Url) -> DctResult<()> {
        self.phase = RtspPhase::Describing;
        let request = self.request("DESCRIBE", uri, &["Accept: application/sdp".to_string()]);
        self.send(uri, "DESCRIBE", &request)?;

        self.phase = RtspPhase::SettingUp;
        let transport_header = format!(
            "Transport: RTP/AVP;unicast;client_port={}-{};mode=PLAY",
            self.local_port,
            self.local_port.saturating_add(1)
        );
        let request = self.request("SETUP", uri, &[transport_header]);
        let response = self.send(uri, "SETUP", &request)?;
        let token = response
            .header("Session")
            .map(|value| value.split(';').next().unwrap_or(value).trim())
            .filter(|token| !token.is_empty())
            .ok_or_else(|| DctError::protocol("SETUP", "response carried no Session header"))?
            .to_string();
        self.session_token = Some(token.clone());

        let request = self.request("PLAY", uri, &[format!("Session: {token}")]);
        self.send(uri, "PLAY", &request)?;
        self.phase = RtspPhase::Playing;
        Ok(())
    }

    fn send(&mut self, uri: &Url, method: &str, request: &str) -> DctResult<RtspResponse> {
        let response = self
            .transport
            .exchange(uri, request)
            .map_err(|e| DctError::network(uri.as_str(), e.to_string()).with_operation(method))?;
        if !response.is_success() {
            return Err(DctError::protocol(
                method,
                format!("status {} {}", response.status, response.reason),
            ));
        }
        Ok(response)
    }

    fn request(&mut self, method: &str, uri: &Url, headers: &[String]) -> String {
        let mut request = format!(
            "{method} {uri} RTSP/1.0\r\nCSeq: {}\r\nUser-Agent: {}\r\n",
            self.c_seq, self.config.user_agent
        );
        self.c_seq += 1;
        for header in headers {
            request.push_str(header);
            request.push_str("\r\n");
        }
        request.push_str("\r\n");
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Arc;
    use parking_lot::Mutex;

    /// Scripted transport that records every request it is given.
    #[derive(Clone, Default)]
    struct ScriptedTransport {
        replies: Arc<Mutex<VecDeque<io::Result<RtspResponse>>>>,
        requests: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedTransport {
        fn reply(&self, status: u16, headers: &[(&str, &str)]) {
            self.replies.lock().push_back(Ok(RtspResponse {
                status,
                reason: "X".to_string(),
                headers: headers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                body: String::new(),
            }));
        }
    }

    impl RtspTransport for ScriptedTransport {
        fn exchange(&mut self, _uri: &Url, request: &str) -> io::Result<RtspResponse> {
            self.requests.lock().push(request.to_string());
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(io::ErrorKind::ConnectionRefused.into()))
        }
    }

    fn uri() -> Url {
        Url::parse("rtsp://192.168.1.20:8554/cetonmpeg0").unwrap()
    }

    fn config(retry_count: u32) -> RtspConfig {
        RtspConfig {
            retry_count,
            retry_wait_ms: 1,
            ..RtspConfig::default()
        }
    }

    #[test]
    fn test_configure_and_teardown() {
        let transport = ScriptedTransport::default();
        transport.reply(200, &[]);
        transport.reply(200, &[("Session", "95151;timeout=60")]);
        transport.reply(200, &[]);
        transport.reply(454, &[]);

        let mut session = RtspControlSession::with_transport(config(0), Box::new(transport.clone()));
        assert!(session.configure_rtp_stream(&uri(), 8300));
        assert_eq!(session.phase(), RtspPhase::Playing);
        assert_eq!(session.session_token(), Some("95151"));

        assert!(session.stop_rtp_stream());
        assert_eq!(session.phase(), RtspPhase::TornDown);

        let requests = transport.requests.lock();
        assert!(requests[0].starts_with("DESCRIBE rtsp://192.168.1.20:8554/cetonmpeg0 RTSP/1.0\r\nCSeq: 1\r\n"));
        assert!(requests[0].contains("Accept: application/sdp\r\n"));
        assert!(requests[1].contains("client_port=8300-8301;mode=PLAY"));
        assert!(requests[2].contains("Session: 95151\r\n"));
        assert!(requests[3].starts_with("TEARDOWN"));
        assert!(requests[3].contains("CSeq: 4\r\n"));
        assert!(requests[3].ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_setup_without_session_retries_from_describe() {
        let transport = ScriptedTransport::default();
        transport.reply(200, &[]);
        transport.reply(200, &[]);
        transport.reply(200, &[]);
        transport.reply(200, &[("Session", "7")]);
        transport.reply(200, &[]);

        let mut session = RtspControlSession::with_transport(config(1), Box::new(transport.clone()));
        assert!(session.configure_rtp_stream(&uri(), 8302));

        let requests = transport.requests.lock();
        assert_eq!(requests.len(), 5);
        assert!(requests[2].starts_with("DESCRIBE"));
        // Sequence numbers keep counting across attempts.
        assert!(requests[4].contains("CSeq: 5\r\n"));
    }

    #[test]
    fn test_teardown_without_session_is_noop() {
        let transport = ScriptedTransport::default();
        let mut session = RtspControlSession::with_transport(config(0), Box::new(transport.clone()));
        assert!(session.stop_rtp_stream());
        assert!(transport.requests.lock().is_empty());
    }

    #[test]
    fn test_teardown_error_is_not_retried() {
        let transport = ScriptedTransport::default();
        transport.reply(200, &[]);
        transport.reply(200, &[("Session", "1")]);
        transport.reply(200, &[]);
        transport.reply(500, &[]);

        let mut session = RtspControlSession::with_transport(config(3), Box::new(transport.clone()));
        assert!(session.configure_rtp_stream(&uri(), 8300));
        assert!(!session.stop_rtp_stream());
        assert_eq!(transport.requests.lock().len(), 4);
    }
}
