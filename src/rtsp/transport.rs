//! One-shot RTSP request/response exchange.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::trace;
use url::Url;

/// Port used when an `rtsp://` URI does not name one.
pub const DEFAULT_RTSP_PORT: u16 = 554;

/// A parsed RTSP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RtspResponse {
    /// Parses the status line and header lines of a response.
    ///
    /// The status line needs at least three tokens: version, code and reason.
    pub fn parse_head(lines: &[String]) -> io::Result<Self> {
        let status_line = lines.first().ok_or_else(|| malformed("empty response"))?;
        let mut tokens = status_line.split_whitespace();
        let (Some(_version), Some(code), Some(_)) = (tokens.next(), tokens.next(), tokens.next())
        else {
            return Err(malformed(format!("invalid status line '{status_line}'")));
        };
        let status = code
            .parse()
            .map_err(|_| malformed(format!("invalid status code '{code}'")))?;
        let reason = status_line
            .splitn(3, ' ')
            .nth(2)
            .unwrap_or_default()
            .to_string();

        let headers = lines[1..]
            .iter()
            .filter_map(|line| {
                let (name, value) = line.split_once(':')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect();

        Ok(Self {
            status,
            reason,
            headers,
            body: String::new(),
        })
    }

    /// Value of the first header called `name`, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_length(&self) -> io::Result<usize> {
        match self.header("Content-Length") {
            Some(value) => value
                .parse()
                .map_err(|_| malformed(format!("invalid Content-Length '{value}'"))),
            None => Ok(0),
        }
    }
}

fn malformed(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

/// Sends one request to the tuner behind `uri` and returns its response.
pub trait RtspTransport: Send {
    fn exchange(&mut self, uri: &Url, request: &str) -> io::Result<RtspResponse>;
}

/// Opens a fresh TCP connection for every request.
#[derive(Debug, Clone)]
pub struct TcpRtspTransport {
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl TcpRtspTransport {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_timeout,
        }
    }
}

impl RtspTransport for TcpRtspTransport {
    fn exchange(&mut self, uri: &Url, request: &str) -> io::Result<RtspResponse> {
        let host = uri
            .host_str()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "RTSP URI has no host"))?;
        let port = uri.port().unwrap_or(DEFAULT_RTSP_PORT);
        let address = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{host} did not resolve")))?;

        let mut stream = TcpStream::connect_timeout(&address, self.connect_timeout)?;
        stream.set_read_timeout(Some(self.read_timeout))?;
        stream.set_write_timeout(Some(self.read_timeout))?;

        trace!(%address, request, "Sending RTSP request");
        stream.write_all(request.as_bytes())?;
        stream.flush()?;

        let mut reader = BufReader::new(stream);
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before the end of the RTSP headers",
                ));
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            lines.push(line.to_string());
        }

        let mut response = RtspResponse::parse_head(&lines)?;
        let length = response.content_length()?;
        if length > 0 {
            let mut body = vec![0u8; length];
            reader.read_exact(&mut body)?;
            response.body = String::from_utf8_lossy(&body).into_owned();
        }

        trace!(status = response.status, "Received RTSP response");
        Ok(response)
    }
}
