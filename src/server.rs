//! HTTP servers streaming payload bytes.
//!
//! Two instances run side by side, one per [`Protocol`], sharing the same
//! [`Handler`]. Each instance reports when its listener is bound, serves
//! until the shared cancellation token fires, then drains in-flight
//! connections for at most [`SHUTDOWN_GRACE`] before closing them.

use crate::protocol::{Protocol, Route, Router};
use crate::stream::{self, StreamOutcome, Streamer};
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// How long in-flight connections may drain after cancellation.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Chunks queued between a stream writer and its connection.
const CHANNEL_DEPTH: usize = 4;

/// Listen backlog
const LISTEN_BACKLOG: i32 = 1024;

type ResponseBody = UnsyncBoxBody<Bytes, Infallible>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Request handling shared by every server instance.
#[derive(Debug)]
pub struct Handler {
    router: Router,
    streamer: Streamer,
}

impl Handler {
    pub fn new(router: Router, streamer: Streamer) -> Self {
        Self { router, streamer }
    }

    /// Route and answer one request. The request body is never read.
    pub async fn handle<B>(&self, req: Request<B>) -> Result<Response<ResponseBody>, Infallible> {
        let route = self.router.route(req.method(), req.uri().path());
        trace!(method = %req.method(), path = req.uri().path(), ?route, "Request");

        let response = match route {
            Route::Stream(size) => self.stream_response(size).await,
            Route::UnhandledMethod => text_response(StatusCode::BAD_REQUEST, "unhandled method"),
            Route::NotFound => text_response(StatusCode::NOT_FOUND, "Not found (no regexp match)"),
            Route::InvalidSize(msg) => text_response(StatusCode::BAD_REQUEST, &msg),
        };
        Ok(response)
    }

    async fn stream_response(&self, size: u64) -> Response<ResponseBody> {
        let (mut sink, head_rx, body) = stream::channel(CHANNEL_DEPTH);
        let streamer = self.streamer.clone();
        tokio::spawn(async move {
            match streamer.stream(&mut sink, size).await {
                StreamOutcome::Complete { written } => trace!(written, "Stream complete"),
                StreamOutcome::Aborted { written } => debug!(written, size, "Stream cut short"),
            }
        });

        let head = match head_rx.await {
            Ok(head) => head,
            Err(_) => {
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "stream failed to start")
            }
        };

        let mut response = Response::new(body.boxed_unsync());
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(head.content_type));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(head.content_length));
        response
    }
}

/// Plain-text error response, newline terminated.
fn text_response(status: StatusCode, msg: &str) -> Response<ResponseBody> {
    let body = Full::new(Bytes::from(format!("{msg}\n")));
    let mut response = Response::new(body.boxed_unsync());
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Lifecycle of a server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Ready,
    Serving,
    ShuttingDown,
    Stopped,
}

/// Settings for one server instance.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub shutdown_grace: Duration,
}

impl ServerOptions {
    pub fn new(host: &str, port: u16, protocol: Protocol) -> Self {
        Self {
            host: host.to_string(),
            port,
            protocol,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }
}

/// Handle to a running server instance.
pub struct ServerHandle {
    protocol: Protocol,
    ready: Option<oneshot::Receiver<Result<SocketAddr, ServerError>>>,
    local_addr: Option<SocketAddr>,
    phase: watch::Receiver<Phase>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Watch lifecycle transitions.
    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.clone()
    }

    /// Wait until the listener is bound, returning its address.
    pub async fn ready(&mut self) -> Result<SocketAddr, ServerError> {
        if let Some(addr) = self.local_addr {
            return Ok(addr);
        }

        let rx = self.ready.take().ok_or(ServerError::Exited)?;
        let addr = rx.await.map_err(|_| ServerError::Exited)??;
        self.local_addr = Some(addr);
        Ok(addr)
    }

    /// Wait for the server task to exit.
    pub async fn stopped(self) {
        if let Err(e) = self.task.await {
            error!(protocol = %self.protocol, error = %e, "Server task failed");
        }
    }
}

/// One listening HTTP server.
pub struct HttpServer;

impl HttpServer {
    /// Start a server task. Returns immediately; use [`ServerHandle::ready`]
    /// to wait for the listener.
    pub fn spawn(
        options: ServerOptions,
        handler: Arc<Handler>,
        cancel: CancellationToken,
    ) -> ServerHandle {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (phase_tx, phase_rx) = watch::channel(Phase::Starting);
        let protocol = options.protocol;

        let task = tokio::spawn(async move {
            let listener = match bind(&options.host, options.port).await {
                Ok(listener) => listener,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    phase_tx.send_replace(Phase::Stopped);
                    return;
                }
            };

            let addr = match listener.local_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    let _ = ready_tx.send(Err(ServerError::Bind(options.host.clone(), e)));
                    phase_tx.send_replace(Phase::Stopped);
                    return;
                }
            };

            info!(addr = %addr, protocol = %protocol, "Server listening");
            phase_tx.send_replace(Phase::Ready);
            let _ = ready_tx.send(Ok(addr));

            serve(listener, &options, handler, cancel, &phase_tx).await;
            phase_tx.send_replace(Phase::Stopped);
            info!(addr = %addr, protocol = %protocol, "Server stopped");
        });

        ServerHandle {
            protocol,
            ready: Some(ready_rx),
            local_addr: None,
            phase: phase_rx,
            task,
        }
    }
}

/// Resolve `host:port` and bind a listener on the first address.
async fn bind(host: &str, port: u16) -> Result<TcpListener, ServerError> {
    let target = format!("{host}:{port}");
    let addr = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ServerError::Bind(target.clone(), e))?
        .next()
        .ok_or_else(|| {
            ServerError::Bind(
                target.clone(),
                io::Error::new(io::ErrorKind::AddrNotAvailable, "no address resolved"),
            )
        })?;

    create_listener(addr).map_err(|e| ServerError::Bind(target, e))
}

/// Create a TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}

/// Accept loop, followed by the bounded drain.
async fn serve(
    listener: TcpListener,
    options: &ServerOptions,
    handler: Arc<Handler>,
    cancel: CancellationToken,
    phase: &watch::Sender<Phase>,
) {
    let mut connections = JoinSet::new();
    phase.send_replace(Phase::Serving);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, protocol = %options.protocol, "New connection");
                    connections.spawn(handle_connection(
                        stream,
                        peer,
                        options.protocol,
                        Arc::clone(&handler),
                        cancel.clone(),
                    ));
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            },

            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Connection task failed");
                }
            }
        }
    }

    phase.send_replace(Phase::ShuttingDown);
    drop(listener);

    let in_flight = connections.len();
    if in_flight > 0 {
        info!(in_flight, protocol = %options.protocol, "Draining connections");
    }

    let drained = tokio::time::timeout(options.shutdown_grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            remaining = connections.len(),
            grace = ?options.shutdown_grace,
            "Grace period elapsed, closing connections"
        );
        connections.shutdown().await;
    }
}

/// Serve one connection until it ends or shutdown is requested.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    protocol: Protocol,
    handler: Arc<Handler>,
    cancel: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let handler = Arc::clone(&handler);
        async move { handler.handle(req).await }
    });

    let result = match protocol {
        Protocol::Http1 => {
            let conn = http1::Builder::new().serve_connection(io, service);
            drive(conn, &cancel, |conn| conn.graceful_shutdown())
                .await
                .map_err(BoxError::from)
        }
        Protocol::H2c => {
            // Prior-knowledge HTTP/2, with HTTP/1.1 for clients that skip the preface.
            let builder = auto::Builder::new(TokioExecutor::new());
            let conn = builder.serve_connection(io, service);
            drive(conn, &cancel, |conn| conn.graceful_shutdown()).await
        }
    };

    if let Err(e) = result {
        debug!(peer = %peer, error = %e, "Connection error");
    }
}

/// Poll `conn` to completion, asking it to wind down once `cancel` fires.
async fn drive<C, E>(
    conn: C,
    cancel: &CancellationToken,
    graceful_shutdown: impl FnOnce(Pin<&mut C>),
) -> Result<(), E>
where
    C: Future<Output = Result<(), E>>,
{
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => return result,
        _ = cancel.cancelled() => {}
    }

    graceful_shutdown(conn.as_mut());
    conn.await
}

/// The HTTP/1.1 and h2c servers, started and stopped together.
pub struct DualServer {
    http1: ServerHandle,
    h2c: ServerHandle,
}

impl DualServer {
    /// Start both instances concurrently.
    pub fn start(
        host: &str,
        http1_port: u16,
        h2c_port: u16,
        handler: Arc<Handler>,
        cancel: &CancellationToken,
    ) -> Self {
        let http1 = HttpServer::spawn(
            ServerOptions::new(host, http1_port, Protocol::Http1),
            Arc::clone(&handler),
            cancel.clone(),
        );
        let h2c = HttpServer::spawn(
            ServerOptions::new(host, h2c_port, Protocol::H2c),
            handler,
            cancel.clone(),
        );
        Self { http1, h2c }
    }

    /// Wait for both listeners. No request may be issued before this returns.
    pub async fn wait_ready(&mut self) -> Result<(SocketAddr, SocketAddr), ServerError> {
        tokio::try_join!(self.http1.ready(), self.h2c.ready())
    }

    pub fn http1(&self) -> &ServerHandle {
        &self.http1
    }

    pub fn h2c(&self) -> &ServerHandle {
        &self.h2c
    }

    /// Wait for both server tasks to exit.
    pub async fn stopped(self) {
        tokio::join!(self.http1.stopped(), self.h2c.stopped());
    }
}

/// Server errors
#[derive(Debug)]
pub enum ServerError {
    /// The listener could not be bound.
    Bind(String, io::Error),
    /// The server task ended before reporting readiness.
    Exited,
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind(addr, e) => write!(f, "cannot listen to {}: {}", addr, e),
            ServerError::Exited => write!(f, "server exited before becoming ready"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind(_, e) => Some(e),
            ServerError::Exited => None,
        }
    }
}
