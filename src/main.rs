use std::fs::File;
use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use dct_capture::capture::{DeviceIdentity, DeviceSource, PassthroughTuner, StreamOpener};
use dct_capture::config::DctConfig;
use dct_capture::consumer::SinkTarget;
use dct_capture::context::CaptureContext;
use dct_capture::upload::UploadSession;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

const UPLOAD_CHUNK: usize = 65_536;

/// Network encoder transport tools:
/// - record any UDP, HTTP or piped transport stream to a file
/// - drive a remote tuner over RTSP and record its RTP output
/// - push a file to a SageTV media server through the upload protocol
#[derive(Parser, Debug)]
#[command(name = "dct")]
#[command(about = "Record and forward MPEG transport streams from network tuners")]
struct Args {
    /// JSON configuration file; missing fields use defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record a stream to a file
    Record {
        /// udp://[ip@]:port, http(s)://... or - for stdin
        #[arg(short, long)]
        source: String,

        #[arg(short, long)]
        output: PathBuf,

        #[arg(short, long, default_value = "30s",
              help = "How long to record: 30s (30 seconds), 2m (2 minutes), 1h (1 hour)")]
        duration: String,

        /// Wrap the file at this many bytes; 0 records linearly
        #[arg(short, long, default_value_t = 0)]
        buffer_size: u64,
    },
    /// Point a remote tuner at this host over RTSP and record its RTP output
    Rtsp {
        #[arg(short, long)]
        uri: Url,

        #[arg(short, long)]
        output: PathBuf,

        /// Local RTP port; taken from the configured range when omitted
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(short, long, default_value = "30s")]
        duration: String,
    },
    /// Upload a file to a media server
    Upload {
        /// host[:port] of the media server; the port defaults to consumer.upload_port
        #[arg(short, long)]
        server: String,

        /// File name the server should write
        #[arg(short, long)]
        filename: String,

        #[arg(short = 'i', long)]
        upload_id: i32,

        #[arg(long)]
        input: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = load_config(args.config.as_deref())?;
    match args.command {
        Command::Record {
            source,
            output,
            duration,
            buffer_size,
        } => {
            let source = parse_source(&source)?;
            record(config, source, output, parse_duration(&duration)?, buffer_size)
        }
        Command::Rtsp {
            uri,
            output,
            port,
            duration,
        } => {
            let mut config = config;
            if let Some(port) = port {
                config.producer.rtp_port_low = port;
                config.producer.rtp_port_high = port.saturating_add(2);
            }
            let source = DeviceSource::Rtp {
                uri,
                remote_ip: None,
            };
            record(config, source, output, parse_duration(&duration)?, 0)
        }
        Command::Upload {
            server,
            filename,
            upload_id,
            input,
        } => upload(config, &server, &filename, upload_id, &input),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: Option<&Path>) -> Result<DctConfig> {
    let config = match path {
        Some(path) => DctConfig::from_json_file(path)
            .with_context(|| format!("Unable to load configuration from {}", path.display()))?,
        None => DctConfig::default(),
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn record(
    config: DctConfig,
    source: DeviceSource,
    output: PathBuf,
    duration: Duration,
    buffer_size: u64,
) -> Result<()> {
    let context = CaptureContext::new(config);
    let device = context.create_device(
        DeviceIdentity::standalone("DCT-Tuner 0", 0),
        Arc::new(PassthroughTuner),
        source,
    );

    if !device.set_locked(true) {
        bail!("Unable to lock the capture device");
    }
    let target = SinkTarget::File {
        path: output.clone(),
    };
    if !device.start_encoding("0", target, "", buffer_size) {
        device.set_locked(false);
        bail!("Unable to start recording to {}", output.display());
    }

    let started = Instant::now();
    while started.elapsed() < duration {
        thread::sleep(Duration::from_secs(1).min(duration.saturating_sub(started.elapsed())));
        info!(
            bytes = device.recorded_bytes(),
            state = device.stream_state().unwrap_or_default().as_str(),
            "Recording"
        );
    }

    device.stop_device();
    device.set_locked(false);
    println!(
        "Recorded {} bytes to {} in {:.1}s",
        device.recorded_bytes(),
        output.display(),
        started.elapsed().as_secs_f64()
    );
    Ok(())
}

fn upload(config: DctConfig, server: &str, filename: &str, upload_id: i32, input: &Path) -> Result<()> {
    let server = resolve(server, config.consumer.upload_port)?;
    let mut file = File::open(input).with_context(|| format!("Unable to open {}", input.display()))?;

    let mut session = UploadSession::new(config.upload);
    if !session
        .start_upload(server, filename, upload_id)
        .context("Unable to reach the media server")?
    {
        bail!("Media server refused {filename} ({upload_id})");
    }

    let mut buffer = vec![0u8; UPLOAD_CHUNK];
    loop {
        let length = file.read(&mut buffer).context("Unable to read the input file")?;
        if length == 0 {
            break;
        }
        session
            .upload_auto_increment(&buffer[..length])
            .context("Upload failed")?;
    }

    let uploaded = session.auto_offset();
    let size = session.size().context("Unable to query the uploaded size")?;
    session.end_upload(true).context("Unable to close the upload")?;
    println!("Uploaded {uploaded} bytes to {filename} on {server} (server reports {size})");
    Ok(())
}

fn resolve(server: &str, default_port: u16) -> Result<SocketAddr> {
    let mut addrs = match server.to_socket_addrs() {
        Ok(addrs) => addrs,
        Err(_) => (server, default_port)
            .to_socket_addrs()
            .with_context(|| format!("Invalid server address: {server}"))?,
    };
    addrs
        .next()
        .ok_or_else(|| anyhow!("Server address resolved to nothing: {server}"))
}

/// Parse a source like "udp://10.0.0.5@:8300", "udp://:8300", "http://..." or "-"
fn parse_source(source: &str) -> Result<DeviceSource> {
    if source == "-" {
        let opener: StreamOpener =
            Box::new(|_channel: &str| Ok(Box::new(io::stdin()) as Box<dyn Read + Send>));
        return Ok(DeviceSource::Stream(opener));
    }

    if let Some(rest) = source.strip_prefix("udp://") {
        let (remote, port) = match rest.split_once('@') {
            Some((ip, port)) => (Some(ip), port),
            None => (None, rest),
        };
        let remote_ip = remote
            .map(|ip| ip.parse::<IpAddr>())
            .transpose()
            .map_err(|_| anyhow!("Invalid sender address in source: {source}"))?;
        let port = port.trim_start_matches(':');
        let local_port: u16 = port
            .parse()
            .map_err(|_| anyhow!("Invalid port in source: {source}"))?;
        return Ok(DeviceSource::Udp {
            remote_ip,
            local_port,
        });
    }

    let url = Url::parse(source).with_context(|| format!("Invalid source: {source}"))?;
    match url.scheme() {
        "http" | "https" => Ok(DeviceSource::Http { urls: vec![url] }),
        other => Err(anyhow!("Unsupported source scheme: {other}. Use udp, http, https or -")),
    }
}

/// Parse duration string like "30s", "2m", "1h"
fn parse_duration(duration: &str) -> Result<Duration> {
    if let Ok(seconds) = duration.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }

    let len = duration.len();
    if len < 2 {
        return Err(anyhow!("Invalid duration format: {}", duration));
    }

    let (num_str, unit) = duration.split_at(len - 1);
    let num: u64 = num_str
        .parse()
        .map_err(|_| anyhow!("Invalid number in duration: {}", num_str))?;

    match unit {
        "s" => Ok(Duration::from_secs(num)),
        "m" => Ok(Duration::from_secs(num * 60)),
        "h" => Ok(Duration::from_secs(num * 3600)),
        _ => Err(anyhow!(
            "Invalid duration unit: {}. Use 's' for seconds, 'm' for minutes, 'h' for hours",
            unit
        )),
    }
}
