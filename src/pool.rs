//! Pooled HTTP client for backend app connections
//!
//! All proxied requests to hosted apps and the console go through one
//! pooled hyper client, so keep-alive connections to each backend port are
//! reused across requests.

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Error type for backend pool operations
#[derive(Debug)]
pub enum PoolError {
    /// Error from the HTTP client
    Client(hyper_util::client::legacy::Error),
    /// Error building a request
    RequestBuild(String),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Client(e) => write!(f, "Client error: {}", e),
            PoolError::RequestBuild(s) => write!(f, "Request build error: {}", s),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<hyper_util::client::legacy::Error> for PoolError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        PoolError::Client(err)
    }
}

/// Configuration for the backend connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per backend port
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Pooled client over loopback connections to hosted app backends
pub struct BackendPool {
    client: Client<HttpConnector, Incoming>,
    config: PoolConfig,
}

impl BackendPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Backend pool initialized"
        );

        Self { client, config }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Forward a request to the backend on `port`, replacing the request
    /// target with `path` (which already carries the query string).
    ///
    /// The inbound Host header is dropped; the client derives the correct
    /// one from the backend URI.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        port: u16,
        path: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let uri = backend_uri(port, path);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (key, value) in parts.headers.iter() {
            if key == hyper::header::HOST {
                continue;
            }
            builder = builder.header(key, value);
        }

        let backend_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        let response = self.client.request(backend_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// URI of a backend resource on the loopback interface
pub fn backend_uri(port: u16, path: &str) -> String {
    let path = if path.starts_with('/') { path } else { "/" };
    format!("http://127.0.0.1:{}{}", port, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_pool_creation() {
        let config = PoolConfig {
            max_idle_per_host: 5,
            idle_timeout: Duration::from_secs(30),
        };
        let pool = BackendPool::new(config);
        assert_eq!(pool.config().max_idle_per_host, 5);
        assert_eq!(pool.config().idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_backend_uri() {
        assert_eq!(backend_uri(8501, "/"), "http://127.0.0.1:8501/");
        assert_eq!(
            backend_uri(8501, "/stream?x=1"),
            "http://127.0.0.1:8501/stream?x=1"
        );
        // Malformed targets collapse to the root
        assert_eq!(backend_uri(8501, "oops"), "http://127.0.0.1:8501/");
    }
}
