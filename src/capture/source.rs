//! Where a capture device gets its transport stream from.

use std::fmt;
use std::io::{self, Read};
use std::net::IpAddr;

use url::Url;

/// Opens the byte stream for a channel, e.g. a device node or a pipe.
pub type StreamOpener = Box<dyn Fn(&str) -> io::Result<Box<dyn Read + Send>> + Send + Sync>;

/// Selects the producer variant a capture device runs.
pub enum DeviceSource {
    /// A remote tuner pointed at a local UDP port through RTSP.
    Rtp { uri: Url, remote_ip: Option<IpAddr> },
    /// RTP already arriving on a fixed local port.
    Udp { remote_ip: Option<IpAddr>, local_port: u16 },
    /// Tried in order until one answers.
    Http { urls: Vec<Url> },
    Stream(StreamOpener),
}

impl DeviceSource {
    /// The address RTP datagrams must come from. Defaults to the RTSP host.
    pub fn rtp_sender(&self) -> Option<IpAddr> {
        match self {
            Self::Rtp { uri, remote_ip } => {
                remote_ip.or_else(|| uri.host_str().and_then(|host| host.parse().ok()))
            }
            Self::Udp { remote_ip, .. } => *remote_ip,
            _ => None,
        }
    }
}

impl fmt::Debug for DeviceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rtp { uri, remote_ip } => f
                .debug_struct("Rtp")
                .field("uri", &uri.as_str())
                .field("remote_ip", remote_ip)
                .finish(),
            Self::Udp {
                remote_ip,
                local_port,
            } => f
                .debug_struct("Udp")
                .field("remote_ip", remote_ip)
                .field("local_port", local_port)
                .finish(),
            Self::Http { urls } => f.debug_struct("Http").field("urls", &urls.len()).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}
