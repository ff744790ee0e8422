use crate::config::ProxyConfig;
use crate::error::{json_error_response, ErrorCode};
use crate::pool::{PoolConfig, UpstreamClient};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::{Request, Response, StatusCode};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Body returned instead of forwarding to the gateway's control API
pub const BLOCKED_BODY: &str = "no!";

/// Where an inbound path goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayRoute {
    /// Forward to the gateway with this path and query
    Forward(String),
    /// Addresses the gateway's control API; answered locally
    Blocked,
    /// Not under the proxy prefix
    NotMatched,
}

/// Forwards traffic under a fixed prefix to the gateway's fixed loopback port.
///
/// The target never changes between restarts; only the paths the gateway
/// answers on do.
pub struct Gateway {
    prefix: String,
    blocked_segment: String,
    request_timeout: Duration,
    upstream: UpstreamClient,
}

impl Gateway {
    pub fn new(config: &ProxyConfig, upstream_port: u16) -> Self {
        Self {
            prefix: config.normalized_prefix().to_string(),
            blocked_segment: config.blocked_segment.clone(),
            request_timeout: config.request_timeout(),
            upstream: UpstreamClient::new(upstream_port, PoolConfig::from(config)),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn upstream(&self) -> &UpstreamClient {
        &self.upstream
    }

    /// Strip the prefix from `path` and decide whether it may be forwarded
    pub fn route(&self, path: &str, query: Option<&str>) -> GatewayRoute {
        let rest = match path.strip_prefix(self.prefix.as_str()) {
            Some("") => "/",
            Some(rest) if rest.starts_with('/') => rest,
            _ => return GatewayRoute::NotMatched,
        };

        if self.is_blocked(rest) {
            return GatewayRoute::Blocked;
        }

        match query {
            Some(q) => GatewayRoute::Forward(format!("{}?{}", rest, q)),
            None => GatewayRoute::Forward(rest.to_string()),
        }
    }

    /// Whether the first segment the gateway would see is the control API.
    ///
    /// Judged on the decoded, dot-normalised path, since the gateway decodes
    /// `%2F` and `%2e` before routing. A path that does not decode is refused.
    fn is_blocked(&self, rest: &str) -> bool {
        if self.blocked_segment.is_empty() {
            return false;
        }
        let decoded = match urlencoding::decode(rest) {
            Ok(decoded) => decoded,
            Err(_) => return true,
        };

        let mut segments: Vec<&str> = Vec::new();
        for segment in decoded.split(['/', '\\']) {
            match segment {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                _ => segments.push(segment),
            }
        }
        segments
            .first()
            .map(|segment| segment.eq_ignore_ascii_case(&self.blocked_segment))
            .unwrap_or(false)
    }

    /// Proxy one request. Upstream failures become error responses, never errors.
    pub async fn forward(
        &self,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let path_and_query = match self.route(req.uri().path(), req.uri().query()) {
            GatewayRoute::Forward(pq) => pq,
            GatewayRoute::Blocked => {
                debug!(path = %req.uri().path(), "Refusing to forward to the gateway control API");
                return blocked_response();
            }
            GatewayRoute::NotMatched => {
                return json_error_response(ErrorCode::NotFound, "not found");
            }
        };

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

        debug!(method = %req.method(), upstream_path = %path_and_query, request_id = %request_id, "Forwarding to gateway");

        let result = tokio::time::timeout(
            self.request_timeout,
            self.upstream.send_request(req, &path_and_query),
        )
        .await;

        match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(port = self.upstream.port(), request_id = %request_id, error = %e, "Gateway unreachable");
                json_error_response(ErrorCode::UpstreamUnavailable, "Gateway is not reachable")
            }
            Err(_) => {
                warn!(
                    port = self.upstream.port(),
                    request_id = %request_id,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Gateway request timed out"
                );
                json_error_response(
                    ErrorCode::RequestTimeout,
                    format!(
                        "Gateway did not answer within {} seconds",
                        self.request_timeout.as_secs()
                    ),
                )
            }
        }
    }
}

fn blocked_response() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::FORBIDDEN)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from_static(BLOCKED_BODY.as_bytes())).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}
