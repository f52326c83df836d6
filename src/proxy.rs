//! Public HTTP gateway
//!
//! Routes:
//! - `GET /` and `GET /new` create a session and redirect into it
//! - `GET /status/<id>` reports session status as JSON
//! - `/<mount>/<id>/<rest>` is proxied to the session's entry point as `/<rest>`

use crate::error::{text_error_response, GatewayErrorCode};
use crate::manager::SessionManager;
use crate::pool::ConnectionPool;
use crate::registry::SessionPhase;
use crate::status;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, ACCEPT, HOST, LOCATION};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub type GatewayBody = BoxBody<Bytes, hyper::Error>;

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Public path prefix of the session, without leading slash
const X_PATH_PREFIX: &str = "x-path-prefix";

/// Upper bound on an upstream upgrade response head
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

pub fn full_body(data: impl Into<Bytes>) -> GatewayBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> GatewayBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

#[derive(Debug, Clone)]
pub struct RouteSettings {
    /// First path segment of proxied session paths
    pub mount_prefix: String,
    /// Serve the starting page until the readiness probe passes
    pub gate_on_readiness: bool,
    pub request_timeout: Duration,
}

struct GatewayContext {
    manager: Arc<SessionManager>,
    pool: Arc<ConnectionPool>,
    routes: RouteSettings,
}

pub struct GatewayServer {
    bind_addr: SocketAddr,
    ctx: Arc<GatewayContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(
        bind_addr: SocketAddr,
        manager: Arc<SessionManager>,
        pool: Arc<ConnectionPool>,
        routes: RouteSettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            ctx: Arc::new(GatewayContext {
                manager,
                pool,
                routes,
            }),
            shutdown_rx,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.ctx.pool
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, mount = %self.ctx.routes.mount_prefix, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&self.ctx);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, ctx).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<GatewayContext>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { handle_request(req, ctx, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    ctx: Arc<GatewayContext>,
    client_addr: SocketAddr,
) -> Result<Response<GatewayBody>, hyper::Error> {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = route_request(req, &ctx, client_addr).await;

    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        client = %client_addr.ip(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request served"
    );
    Ok(response)
}

/// A parsed gateway route
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Create,
    Status(String),
    Session { id: String, rest: String },
    NotFound,
}

pub fn parse_route(path: &str, mount_prefix: &str) -> Route {
    if path == "/" || path == "/new" || path == "/new/" {
        return Route::Create;
    }

    let trimmed = path.trim_start_matches('/');

    if let Some(id) = trimmed.strip_prefix("status/") {
        let id = id.trim_matches('/');
        if id.is_empty() || id.contains('/') {
            return Route::NotFound;
        }
        return Route::Status(id.to_string());
    }

    let Some(after_mount) = trimmed
        .strip_prefix(mount_prefix)
        .and_then(|rest| rest.strip_prefix('/'))
    else {
        return Route::NotFound;
    };

    let (id, rest) = after_mount.split_once('/').unwrap_or((after_mount, ""));
    if id.is_empty() {
        return Route::NotFound;
    }

    Route::Session {
        id: id.to_string(),
        rest: rest.to_string(),
    }
}

/// Path and query sent upstream for the remainder of a session path
pub fn upstream_path(rest: &str, query: Option<&str>) -> String {
    match query {
        Some(q) => format!("/{}?{}", rest, q),
        None => format!("/{}", rest),
    }
}

/// Whether a request looks like a browser page load
pub fn is_html_navigation<B>(req: &Request<B>) -> bool {
    if req.method() != Method::GET {
        return false;
    }

    match req.headers().get(ACCEPT).and_then(|v| v.to_str().ok()) {
        None => true,
        Some(accept) => {
            let accept = accept.trim();
            accept.is_empty()
                || accept == "*/*"
                || accept.contains("text/html")
                || accept.contains("application/xhtml+xml")
        }
    }
}

async fn route_request(
    req: Request<Incoming>,
    ctx: &GatewayContext,
    client_addr: SocketAddr,
) -> Response<GatewayBody> {
    match parse_route(req.uri().path(), &ctx.routes.mount_prefix) {
        Route::Create => {
            // HEAD would provision a session nobody visits
            if req.method() != Method::GET {
                return text_error_response(GatewayErrorCode::MethodNotAllowed, "method not allowed");
            }
            handle_create(ctx).await
        }
        Route::Status(id) => status::status_response(&ctx.manager.status(&id).await),
        Route::Session { id, rest } => handle_session(req, ctx, &id, &rest, client_addr).await,
        Route::NotFound => text_error_response(GatewayErrorCode::NotFound, "not found"),
    }
}

async fn handle_create(ctx: &GatewayContext) -> Response<GatewayBody> {
    match ctx.manager.create_session().await {
        Ok(session) => {
            let location = status::session_path(&ctx.routes.mount_prefix, &session.id);
            Response::builder()
                .status(StatusCode::TEMPORARY_REDIRECT)
                .header(LOCATION, location)
                .header("Cache-Control", "no-store")
                .body(empty_body())
                .expect("valid redirect response")
        }
        Err(e) => {
            error!(error = %e, "Session creation failed");
            status::failed_page()
        }
    }
}

fn starting_response(navigation: bool, mount_prefix: &str, id: &str) -> Response<GatewayBody> {
    if navigation {
        status::starting_page(mount_prefix, id)
    } else {
        text_error_response(GatewayErrorCode::SessionStarting, "starting")
    }
}

async fn handle_session(
    mut req: Request<Incoming>,
    ctx: &GatewayContext,
    id: &str,
    rest: &str,
    client_addr: SocketAddr,
) -> Response<GatewayBody> {
    let mount = &ctx.routes.mount_prefix;

    let Some(entry) = ctx.manager.lookup(id) else {
        return status::expired_page(mount, id);
    };

    let navigation = is_html_navigation(&req);
    let endpoints = match (entry.phase, entry.session.endpoints()) {
        (SessionPhase::Live, Some(endpoints)) => endpoints,
        _ => return starting_response(navigation, mount, id),
    };

    if ctx.routes.gate_on_readiness && !ctx.manager.is_ready(&entry.session).await {
        return starting_response(navigation, mount, id);
    }

    let path_and_query = upstream_path(rest, req.uri().query());
    let request_id = apply_forwarding_headers(&mut req, client_addr, &format!("{}/{}", mount, id));
    debug!(session_id = %id, method = %req.method(), path = %path_and_query, request_id = %request_id, "Forwarding request");

    let timeout = ctx.routes.request_timeout;

    if is_upgrade_request(&req) {
        return match handle_upgrade(req, &endpoints.entry, &path_and_query, id, &request_id, timeout).await {
            Ok(response) => response,
            Err(UpgradeFailure::Unreachable) => starting_response(false, mount, id),
            Err(UpgradeFailure::TimedOut) => timeout_response(id, timeout),
        };
    }

    match tokio::time::timeout(timeout, ctx.pool.send_request(req, &endpoints.entry, &path_and_query)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            debug!(session_id = %id, entry = %endpoints.entry, error = %e, "Session entry point not reachable");
            starting_response(navigation, mount, id)
        }
        Err(_) => timeout_response(id, timeout),
    }
}

fn timeout_response(id: &str, timeout: Duration) -> Response<GatewayBody> {
    warn!(session_id = %id, timeout_secs = timeout.as_secs(), "Request timed out");
    text_error_response(
        GatewayErrorCode::UpstreamTimeout,
        format!("request timed out after {} seconds", timeout.as_secs()),
    )
}

/// Overwrite the X-Forwarded-* family and return the request id
fn apply_forwarding_headers<B>(req: &mut Request<B>, client_addr: SocketAddr, path_prefix: &str) -> String {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    if let Ok(value) = HeaderValue::from_str(path_prefix) {
        headers.insert(X_PATH_PREFIX, value);
    }

    request_id
}

fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Raw HTTP/1.1 upgrade request for the session entry point
fn build_upgrade_request<B>(req: &Request<B>, entry: &str, path_and_query: &str) -> Vec<u8> {
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path_and_query);

    for (name, value) in req.headers() {
        if name == HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: {}\r\n\r\n", entry));
    request.into_bytes()
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Parse status and headers from a response head
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let head = std::str::from_utf8(data).ok()?;
    let mut lines = head.lines();

    let status_line = lines.next()?;
    let code: u16 = status_line.split(' ').nth(1)?.parse().ok()?;
    let status = StatusCode::from_u16(code).ok()?;

    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Some((status, headers))
}

/// Read an upstream response head; returns the head and any bytes after it
async fn read_response_head(stream: &mut TcpStream) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before response head",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_head_end(&buf) {
            let trailing = buf.split_off(end);
            return Ok((buf, trailing));
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "response head too large",
            ));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpgradeFailure {
    Unreachable,
    TimedOut,
}

/// Relay an upgrade (e.g. WebSocket) to the session. Connecting and reading
/// the upstream response head share one deadline.
async fn handle_upgrade(
    req: Request<Incoming>,
    entry: &str,
    path_and_query: &str,
    session_id: &str,
    request_id: &str,
    timeout: Duration,
) -> Result<Response<GatewayBody>, UpgradeFailure> {
    let raw_request = build_upgrade_request(&req, entry, path_and_query);
    let deadline = tokio::time::Instant::now() + timeout;

    let mut upstream = match tokio::time::timeout_at(deadline, TcpStream::connect(entry)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(session_id, entry, error = %e, "Session entry point not reachable for upgrade");
            return Err(UpgradeFailure::Unreachable);
        }
        Err(_) => return Err(UpgradeFailure::TimedOut),
    };

    if let Err(e) = upstream.write_all(&raw_request).await {
        debug!(session_id, error = %e, "Failed to send upgrade request");
        return Err(UpgradeFailure::Unreachable);
    }

    let (head, trailing) = match tokio::time::timeout_at(deadline, read_response_head(&mut upstream)).await {
        Ok(Ok(parts)) => parts,
        Ok(Err(e)) => {
            debug!(session_id, error = %e, "Failed to read upgrade response");
            return Err(UpgradeFailure::Unreachable);
        }
        Err(_) => return Err(UpgradeFailure::TimedOut),
    };

    let Some((status, response_headers)) = parse_upgrade_response(&head) else {
        warn!(session_id, "Invalid upgrade response from session");
        return Ok(text_error_response(
            GatewayErrorCode::InternalError,
            "invalid upgrade response",
        ));
    };

    let mut response = Response::builder().status(status);
    for (name, value) in &response_headers {
        let lower = name.to_lowercase();
        if lower == "content-length" || lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }
    let response = response
        .body(empty_body())
        .map_err(|_| UpgradeFailure::Unreachable)?;

    if status != StatusCode::SWITCHING_PROTOCOLS {
        debug!(session_id, status = %status, "Session rejected upgrade");
        return Ok(response);
    }

    let session_id = session_id.to_string();
    let request_id = request_id.to_string();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => relay(upgraded, upstream, trailing, &session_id, &request_id).await,
            Err(e) => error!(session_id, error = %e, "Failed to upgrade client connection"),
        }
    });

    Ok(response)
}

async fn relay(
    client: Upgraded,
    mut upstream: TcpStream,
    trailing: Vec<u8>,
    session_id: &str,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);

    if !trailing.is_empty() {
        if let Err(e) = client_io.write_all(&trailing).await {
            debug!(session_id, request_id, error = %e, "Client went away during upgrade");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream).await {
        Ok((to_session, to_client)) => {
            debug!(session_id, request_id, to_session, to_client, "Upgraded connection closed");
        }
        Err(e) => {
            debug!(session_id, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}
