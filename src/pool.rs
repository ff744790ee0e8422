//! Pooled HTTP client for the local gateway
//!
//! All proxied traffic goes to one fixed loopback port, so a single pooled
//! client is kept for the lifetime of the playground.

use crate::config::ProxyConfig;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Error type for upstream requests
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Error from the HTTP client (connection refused, reset, ...)
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error building the upstream request
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Request counters for the upstream client
#[derive(Debug, Default)]
pub struct PoolStats {
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the upstream client
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// Connect timeout, so an unbound port fails fast
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

impl From<&ProxyConfig> for PoolConfig {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            max_idle_per_host: config.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.pool_idle_timeout_secs),
            connect_timeout: config.connect_timeout(),
        }
    }
}

/// Pooled client forwarding requests to the gateway's loopback port
pub struct UpstreamClient {
    client: Client<HttpConnector, Incoming>,
    port: u16,
    stats: Arc<PoolStats>,
}

impl UpstreamClient {
    pub fn new(port: u16, config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(config.connect_timeout));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            port,
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Upstream client initialized"
        );

        Self {
            client,
            port,
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward `req` to the gateway, replacing its path and query with `path_and_query`.
    /// Method, headers and body are passed through untouched.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        path_and_query: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let uri = format!("http://127.0.0.1:{}{}", self.port, path_and_query);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder()
            .method(parts.method)
            .uri(&uri)
            .version(hyper::Version::HTTP_11);

        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let upstream_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_request();

        let response = match self.client.request(upstream_req).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e.into());
            }
        };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}
