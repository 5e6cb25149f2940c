//! Measuring HTTP client.
//!
//! Downloads a URL over a chosen [`Protocol`], discarding the body into a
//! [`MetricsSink`]. TLS is never used: h2c is spoken with prior knowledge,
//! straight over the TCP stream, without an Upgrade round trip.

use crate::format::format_bit_rate;
use crate::metrics::{MetricsSink, TransferMetrics};
use crate::protocol::Protocol;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::client::conn::{http1, http2};
use hyper::header::HOST;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Connection establishment deadline, resolution included.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP/2 receive windows advertised by the client.
const H2_STREAM_WINDOW: u32 = 4 * 1024 * 1024;
const H2_CONNECTION_WINDOW: u32 = 1024 * 1024 * 1024;

/// Result of one download.
#[derive(Debug, Clone)]
pub struct DownloadReport {
    /// Protocol negotiated with the server
    pub version: Version,
    pub status: StatusCode,
    /// Wall time from sending the request to the end of the body
    pub duration: Duration,
    /// Counters recorded by the sink
    pub metrics: TransferMetrics,
}

impl DownloadReport {
    pub fn total_bytes(&self) -> u64 {
        self.metrics.total_bytes
    }

    /// Human-readable bit rate over the full request duration.
    pub fn rate(&self) -> String {
        format_bit_rate(self.duration.as_secs_f64(), self.metrics.total_bytes)
    }
}

impl std::fmt::Display for DownloadReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "received {} bytes in {:?} = {} ({} writes, largest {} bytes)",
            self.total_bytes(),
            self.duration,
            self.rate(),
            self.metrics.write_count,
            self.metrics.step_size
        )
    }
}

/// Download `url` with `protocol`, giving up when `cancel` fires.
pub async fn download(
    cancel: &CancellationToken,
    url: &str,
    protocol: Protocol,
) -> Result<DownloadReport, ClientError> {
    tokio::select! {
        result = fetch(url, protocol) => result,
        _ = cancel.cancelled() => Err(ClientError::Cancelled),
    }
}

async fn fetch(url: &str, protocol: Protocol) -> Result<DownloadReport, ClientError> {
    let uri: Uri = url
        .parse()
        .map_err(|e| ClientError::InvalidUrl(format!("{url}: {e}")))?;

    if uri.scheme_str() != Some("http") {
        return Err(ClientError::InvalidUrl(format!(
            "{url}: only http:// URLs are supported"
        )));
    }
    let authority = uri
        .authority()
        .ok_or_else(|| ClientError::InvalidUrl(format!("{url}: missing host")))?
        .clone();

    let host = authority.host().trim_start_matches('[').trim_end_matches(']');
    let port = authority.port_u16().unwrap_or(80);
    let stream = dial(host, port).await?;
    let io = TokioIo::new(stream);

    let (response, start) = match protocol {
        Protocol::Http1 => {
            let (mut sender, conn) = http1::handshake(io).await.map_err(ClientError::Handshake)?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(error = %e, "HTTP/1.1 connection closed");
                }
            });

            let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
            let req = Request::get(path)
                .header(HOST, authority.as_str())
                .body(Empty::<Bytes>::new())
                .map_err(ClientError::Build)?;

            let start = Instant::now();
            let response = sender.send_request(req).await.map_err(ClientError::Request)?;
            (response, start)
        }
        Protocol::H2c => {
            let (mut sender, conn) = http2::Builder::new(TokioExecutor::new())
                .initial_stream_window_size(H2_STREAM_WINDOW)
                .initial_connection_window_size(H2_CONNECTION_WINDOW)
                .handshake(io)
                .await
                .map_err(ClientError::Handshake)?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(error = %e, "HTTP/2 connection closed");
                }
            });

            let req = Request::get(uri)
                .body(Empty::<Bytes>::new())
                .map_err(ClientError::Build)?;

            let start = Instant::now();
            let response = sender.send_request(req).await.map_err(ClientError::Request)?;
            (response, start)
        }
    };

    info!(protocol = ?response.version(), status = %response.status(), "Receiving data");
    if !response.status().is_success() {
        return Err(ClientError::Status(response.status()));
    }

    let version = response.version();
    let status = response.status();
    let metrics = drain(response).await?;

    Ok(DownloadReport {
        version,
        status,
        duration: start.elapsed(),
        metrics,
    })
}

/// Consume the body into a fresh sink. End of body is success.
async fn drain(response: Response<Incoming>) -> Result<TransferMetrics, ClientError> {
    let sink = MetricsSink::new();
    let mut body = response.into_body();

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(ClientError::Body)?;
        // h2 may end the stream with an empty DATA frame; that is not a write.
        if let Some(data) = frame.data_ref().filter(|data| !data.is_empty()) {
            sink.write(data);
        }
    }

    let metrics = sink.snapshot();
    debug!(
        bytes = metrics.total_bytes,
        writes = metrics.write_count,
        since_first_write = ?metrics.elapsed(),
        "Body drained"
    );
    Ok(metrics)
}

/// Connect to the first resolved address only, without racing address
/// families against each other.
async fn dial(host: &str, port: u16) -> Result<TcpStream, ClientError> {
    let target = format!("{host}:{port}");

    let connect = async {
        let addr: SocketAddr = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| ClientError::Resolve(target.clone(), e))?
            .next()
            .ok_or_else(|| {
                ClientError::Resolve(
                    target.clone(),
                    io::Error::new(io::ErrorKind::NotFound, "no address resolved"),
                )
            })?;

        TcpStream::connect(addr)
            .await
            .map_err(|e| ClientError::Connect(addr, e))
    };

    let stream = tokio::time::timeout(DIAL_TIMEOUT, connect)
        .await
        .map_err(|_| ClientError::ConnectTimeout(target.clone()))??;

    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Client errors, reported once per download.
#[derive(Debug)]
pub enum ClientError {
    InvalidUrl(String),
    Resolve(String, io::Error),
    Connect(SocketAddr, io::Error),
    ConnectTimeout(String),
    Handshake(hyper::Error),
    Build(hyper::http::Error),
    Request(hyper::Error),
    Status(StatusCode),
    Body(hyper::Error),
    Cancelled,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::InvalidUrl(msg) => write!(f, "invalid url {}", msg),
            ClientError::Resolve(target, e) => write!(f, "cannot resolve {}: {}", target, e),
            ClientError::Connect(addr, e) => write!(f, "cannot connect to {}: {}", addr, e),
            ClientError::ConnectTimeout(target) => {
                write!(f, "timed out connecting to {} after {:?}", target, DIAL_TIMEOUT)
            }
            ClientError::Handshake(e) => write!(f, "handshake failed: {}", e),
            ClientError::Build(e) => write!(f, "cannot build request: {}", e),
            ClientError::Request(e) => write!(f, "request failed: {}", e),
            ClientError::Status(status) => write!(f, "unexpected status {}", status),
            ClientError::Body(e) => write!(f, "body transfer failed: {}", e),
            ClientError::Cancelled => write!(f, "download cancelled"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Resolve(_, e) | ClientError::Connect(_, e) => Some(e),
            ClientError::Handshake(e) | ClientError::Request(e) | ClientError::Body(e) => Some(e),
            ClientError::Build(e) => Some(e),
            _ => None,
        }
    }
}
