//! Public-facing reverse proxy
//!
//! One listener carries everything: the management API under `/api`, the
//! admin console under `/console`, and hosted app traffic under
//! `/apps/{app_id}`. App routes are resolved against the registry on every
//! request, so lifecycle transitions take effect immediately. WebSocket
//! upgrades are relayed over a raw TCP connection to the backend.

use crate::api;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::BackendPool;
use crate::registry::AppStatus;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Shared context for request handling on all connections
pub struct ProxyState {
    pub orchestrator: Arc<crate::orchestrator::Orchestrator>,
    pub pool: BackendPool,
    /// Internal port of the admin console, if one is running
    pub console_port: Option<u16>,
    pub request_timeout: Duration,
    /// Base URL used when building app links
    pub public_base: String,
}

/// The public proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    state: Arc<ProxyState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        state: Arc<ProxyState>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, state).await {
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
                        info!("Proxy server shutting down");
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
    state: Arc<ProxyState>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr).await }
    });

    // auto::Builder carries both HTTP/1.1 (with upgrades) and h2c
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .title_case_headers(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Where a request goes, derived from its path
#[derive(Debug, Clone, PartialEq)]
enum Route {
    /// Management API under /api
    Api,
    /// Liveness endpoint
    Health,
    /// The bare root
    Root,
    /// Admin console under /console, path forwarded unchanged
    Console,
    /// Hosted app traffic; `path` is the backend-relative remainder
    App { app_id: String, path: String },
    NotFound,
}

fn classify(path: &str) -> Route {
    if path.is_empty() || path == "/" {
        return Route::Root;
    }
    if path == "/health" {
        return Route::Health;
    }
    if path == "/api" || path.starts_with("/api/") {
        return Route::Api;
    }
    if path == "/console" || path.starts_with("/console/") {
        return Route::Console;
    }
    if let Some(rest) = path.strip_prefix("/apps/") {
        let (app_id, sub) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        if !app_id.is_empty() {
            return Route::App {
                app_id: app_id.to_string(),
                path: sub.to_string(),
            };
        }
    }
    Route::NotFound
}

/// Backend request target: rewritten path plus the original query string
fn target_with_query(path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{}?{}", path, q),
        _ => path.to_string(),
    }
}

async fn handle_request(
    mut req: Request<Incoming>,
    state: Arc<ProxyState>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Overwrite X-Forwarded-* rather than appending; this proxy is the
    // first trusted hop.
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    let route = classify(req.uri().path());
    let query = req.uri().query().map(|q| q.to_string());
    debug!(method = %req.method(), uri = %req.uri(), request_id, ?route, "Incoming request");

    match route {
        Route::Api => Ok(api::handle_api(req, &state).await),
        Route::Health => Ok(health_response()),
        Route::Root => Ok(root_response(&state)),
        Route::Console => {
            let Some(port) = state.console_port else {
                return Ok(json_error_response(
                    ProxyErrorCode::ConsoleUnavailable,
                    "No console is configured on this host",
                ));
            };
            let path = req.uri().path().to_string();
            let target = target_with_query(&path, query.as_deref());
            forward(req, &state, port, target, "console", &request_id).await
        }
        Route::App { app_id, path } => {
            let record = match state.orchestrator.registry().get(&app_id) {
                Ok(record) => record,
                Err(_) => {
                    return Ok(json_error_response(
                        ProxyErrorCode::UnknownApp,
                        format!("No app with id {}", app_id),
                    ));
                }
            };
            let port = match record.status {
                AppStatus::Running { port, .. } => port,
                ref status => {
                    return Ok(json_error_response(
                        ProxyErrorCode::AppNotReady,
                        format!("App {} is {}", app_id, status.label()),
                    ));
                }
            };
            let target = target_with_query(&path, query.as_deref());
            forward(req, &state, port, target, &app_id, &request_id).await
        }
        Route::NotFound => Ok(json_error_response(
            ProxyErrorCode::UnknownApp,
            "No route matches this path",
        )),
    }
}

/// Forward a request (plain or upgrade) to a loopback backend
async fn forward(
    req: Request<Incoming>,
    state: &Arc<ProxyState>,
    port: u16,
    target: String,
    context: &str,
    request_id: &str,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if is_upgrade_request(&req) {
        return handle_upgrade(req, port, target, context.to_string(), request_id.to_string())
            .await;
    }

    let result =
        tokio::time::timeout(state.request_timeout, state.pool.send_request(req, port, &target))
            .await;

    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(context, port, error = %e, "Failed to forward request via pool");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to backend",
            ))
        }
        Err(_) => {
            warn!(
                context,
                port,
                timeout_secs = state.request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Request timed out after {} seconds",
                    state.request_timeout.as_secs()
                ),
            ))
        }
    }
}

fn health_response() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(
            Full::new(Bytes::from(r#"{"status":"ok"}"#))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

/// The bare root points at the console when one is configured
fn root_response(state: &ProxyState) -> Response<BoxBody<Bytes, hyper::Error>> {
    if state.console_port.is_some() {
        return Response::builder()
            .status(StatusCode::FOUND)
            .header(hyper::header::LOCATION, "/console/")
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder");
    }
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(
            Full::new(Bytes::from("app host is running\n"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

/// Check if a request is a WebSocket/HTTP upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

/// Get the value of the Upgrade header
fn get_upgrade_type<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
}

/// Build the raw HTTP upgrade request sent to the backend, with the
/// request target rewritten to `target`
fn build_upgrade_request<B>(req: &Request<B>, port: u16, target: &str) -> Vec<u8> {
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), target);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: 127.0.0.1:{}\r\n", port));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the backend's response head to check for 101 Switching Protocols
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // Status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Forward bytes bidirectionally between client and backend connections
async fn forward_bidirectional(client: Upgraded, backend: TcpStream, context: &str, request_id: &str) {
    let mut client_io = TokioIo::new(client);
    let mut backend_io = backend;

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                context,
                request_id,
                client_to_backend,
                backend_to_client,
                "WebSocket connection closed normally"
            );
        }
        Err(e) => {
            debug!(context, request_id, error = %e, "WebSocket connection closed with error");
        }
    }
}

/// Relay a WebSocket upgrade to the backend over a raw TCP connection
async fn handle_upgrade(
    req: Request<Incoming>,
    port: u16,
    target: String,
    context: String,
    request_id: String,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());
    debug!(context, request_id, upgrade_type, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, port, &target);

    let backend_addr = format!("127.0.0.1:{}", port);
    let mut backend_stream = match TcpStream::connect(&backend_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(context, port, error = %e, "Failed to connect to backend for upgrade");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                format!("Failed to connect to backend: {}", e),
            ));
        }
    };

    if let Err(e) = backend_stream.write_all(&raw_request).await {
        error!(context, error = %e, "Failed to send upgrade request to backend");
        return Ok(json_error_response(
            ProxyErrorCode::ConnectionFailed,
            format!("Failed to send upgrade request: {}", e),
        ));
    }

    let mut response_buf = vec![0u8; 4096];
    let n = match backend_stream.read(&mut response_buf).await {
        Ok(n) if n > 0 => n,
        Ok(_) => {
            error!(context, "Backend closed connection before responding to upgrade");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Backend closed connection",
            ));
        }
        Err(e) => {
            error!(context, error = %e, "Failed to read upgrade response from backend");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                format!("Failed to read backend response: {}", e),
            ));
        }
    };

    let (status, response_headers) = match parse_upgrade_response(&response_buf[..n]) {
        Some(parsed) => parsed,
        None => {
            error!(context, "Failed to parse backend upgrade response");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Invalid upgrade response from backend",
            ));
        }
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(context, status = %status, "Backend rejected upgrade request");
        // Return the backend's non-101 response as-is
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return Ok(response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder"));
    }

    info!(context, request_id, upgrade_type, "WebSocket upgrade successful");

    // Build the 101 response for the client
    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        // Skip hop-by-hop headers that hyper handles
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }

    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                debug!(context, request_id, "Client upgrade complete, starting forwarding");
                forward_bidirectional(upgraded, backend_stream, &context, &request_id).await;
            }
            Err(e) => {
                error!(context, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}
