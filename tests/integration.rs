//! Integration tests for gwplay
//!
//! Each test runs the real front server on an ephemeral port. A `sh -c`
//! script stands in for the gateway binary and a raw TCP listener stands in
//! for whatever the gateway would serve on its upstream port.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gwplay::config::{Config, GatewayConfig};
use gwplay::front::{FrontServer, Playground};
use gwplay::pair::{ConfigurationPair, DefaultPair};
use gwplay::share::ShareStore;
use gwplay::supervisor::Supervisor;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const DEFAULT_CONF: &str = r#"{"listen_port":8080}"#;
const DEFAULT_DEF: &str = r#"{"name":"Default","proxy":{"listen_path":"/default/"}}"#;
const TEST_DEF: &str = r#"{"name":"Test","proxy":{"listen_path":"/test/"}}"#;

/// Gateway stand-in: prints its definition, then idles until terminated
const GATEWAY_SCRIPT: &str = "cat apps/test.json; echo; exec sleep 30";

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    port: u16,
    supervisor: Arc<Supervisor>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
    _dir: tempfile::TempDir,
    share_dir: std::path::PathBuf,
}

impl Harness {
    async fn start(upstream_port: u16) -> Self {
        Self::start_with(upstream_port, |_| {}).await
    }

    async fn start_with(upstream_port: u16, customize: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut config = Config::default();
        config.server.public_url = Some(format!("http://127.0.0.1:{}", port));
        config.gateway = GatewayConfig::command("sh", &dir.path().join("gateway").to_string_lossy())
            .with_args(vec!["-c".to_string(), GATEWAY_SCRIPT.to_string()]);
        config.gateway.upstream_port = upstream_port;
        config.gateway.shutdown_grace_period_ms = 1000;
        config.proxy.connect_timeout_ms = 500;
        config.proxy.request_timeout_secs = 5;
        config.share.dir = dir.path().join("shares").to_string_lossy().to_string();
        customize(&mut config);

        let supervisor = Arc::new(Supervisor::new(config.gateway.clone()));
        let shares = ShareStore::new(&config.share.dir).with_fallback_conf(DEFAULT_CONF);
        let defaults = DefaultPair::new(ConfigurationPair::new(DEFAULT_CONF, DEFAULT_DEF));
        let playground = Arc::new(Playground::new(&config, Arc::clone(&supervisor), shares, defaults));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        let server = FrontServer::new(addr, playground, shutdown_rx);
        let handle = tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        Self {
            port,
            supervisor,
            shutdown_tx,
            handle,
            share_dir: dir.path().join("shares"),
            _dir: dir,
        }
    }

    fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    async fn stop(self) {
        self.supervisor.shutdown().await;
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

/// Raw TCP upstream answering every request with its request line and the
/// X-Forwarded-For header it saw
struct MockUpstream {
    port: u16,
    hits: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl MockUpstream {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let head = read_head(&mut stream).await;
                    counter.fetch_add(1, Ordering::SeqCst);

                    let request_line = head.lines().next().unwrap_or_default().to_string();
                    let forwarded = head
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("x-forwarded-for").then(|| value.trim().to_string())
                        })
                        .unwrap_or_default();
                    let body = format!("{}\nforwarded-for: {}\n", request_line, forwarded);
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-Upstream: mock\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Self { port, hits, handle }
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Read the request head, then drain a Content-Length body if there is one
async fn read_head(stream: &mut TcpStream) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return String::from_utf8_lossy(&data).to_string(),
            Ok(n) => data.extend_from_slice(&buf[..n]),
        }
    };

    let head = String::from_utf8_lossy(&data[..head_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length").then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);

    while data.len() < head_end + content_length {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => data.extend_from_slice(&buf[..n]),
        }
    }
    head
}

/// A port nothing listens on
async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// ============================================================================
// HTTP helpers
// ============================================================================

/// Send a simple HTTP request and get response
async fn http_get(port: u16, path: &str) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
        path, port
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

/// Send an HTTP POST with a body and get response
async fn http_post(
    port: u16,
    path: &str,
    content_type: &str,
    body: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let request = format!(
        "POST {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        path,
        port,
        content_type,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

fn form_body(conf: &str, def: &str) -> String {
    format!(
        "conf={}&def={}",
        urlencoding::encode(conf),
        urlencoding::encode(def)
    )
}

async fn post_form(port: u16, path: &str, conf: &str, def: &str) -> String {
    http_post(port, path, "application/x-www-form-urlencoded", &form_body(conf, def))
        .await
        .unwrap()
}

fn status_line(response: &str) -> &str {
    response.lines().next().unwrap_or_default()
}

fn body(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or_default()
}

async fn wait_for_output(port: u16, needle: &str) -> String {
    let start = Instant::now();
    loop {
        let response = http_get(port, "/output").await.unwrap();
        if response.contains(needle) || start.elapsed() > Duration::from_secs(5) {
            return body(&response).to_string();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn share_name(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or_default()
}

// ============================================================================
// Control plane
// ============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let harness = Harness::start(unused_port().await).await;

    let response = http_get(harness.port, "/health").await.unwrap();
    assert!(status_line(&response).contains("200"), "Response: {}", response);
    assert_eq!(body(&response), "ok");

    // Trailing slashes are ignored on control paths
    let response = http_get(harness.port, "/health/").await.unwrap();
    assert!(status_line(&response).contains("200"), "Response: {}", response);

    harness.stop().await;
}

#[tokio::test]
async fn test_index_restarts_with_defaults() {
    let harness = Harness::start(unused_port().await).await;

    let response = http_get(harness.port, "/").await.unwrap();
    assert!(status_line(&response).contains("200"), "Response: {}", response);
    assert!(response.contains("text/html"));
    // The default pair is shown, HTML-escaped
    assert!(response.contains("&#34;listen_path&#34;:&#34;/default/&#34;"));
    assert!(response.contains(&harness.base_url()));

    let current = harness.supervisor.current().await.unwrap();
    assert_eq!(current.id, 1);

    let output = wait_for_output(harness.port, "/default/").await;
    assert!(output.contains("/default/"), "Output: {}", output);

    harness.stop().await;
}

#[tokio::test]
async fn test_restart_returns_route_url() {
    let harness = Harness::start(unused_port().await).await;

    let response = post_form(harness.port, "/restart", DEFAULT_CONF, TEST_DEF).await;
    assert!(status_line(&response).contains("200"), "Response: {}", response);
    assert_eq!(body(&response), format!("{}/gw/test/", harness.base_url()));

    let output = wait_for_output(harness.port, "/test/").await;
    assert!(output.contains("\"name\":\"Test\""), "Output: {}", output);

    let status = http_get(harness.port, "/status").await.unwrap();
    assert!(status.contains("\"running\":true"), "Status: {}", status);
    assert!(status.contains("\"id\":1"), "Status: {}", status);
    assert!(status.contains("\"output_truncated\":false"), "Status: {}", status);

    harness.stop().await;
}

#[tokio::test]
async fn test_restart_accepts_json_body() {
    let harness = Harness::start(unused_port().await).await;

    let body_json = serde_json::json!({ "conf": DEFAULT_CONF, "def": TEST_DEF }).to_string();
    let response = http_post(harness.port, "/restart", "application/json", &body_json)
        .await
        .unwrap();
    assert!(status_line(&response).contains("200"), "Response: {}", response);
    assert!(body(&response).ends_with("/gw/test/"));

    harness.stop().await;
}

#[tokio::test]
async fn test_restart_with_invalid_conf_keeps_previous_generation() {
    let harness = Harness::start(unused_port().await).await;

    let response = post_form(harness.port, "/restart", DEFAULT_CONF, TEST_DEF).await;
    assert!(status_line(&response).contains("200"), "Response: {}", response);
    let first = harness.supervisor.current().await.unwrap();

    let response = post_form(harness.port, "/restart", "{not json", TEST_DEF).await;
    assert!(status_line(&response).contains("400"), "Response: {}", response);
    assert!(response.contains("INVALID_INPUT"));
    assert!(response.to_lowercase().contains("x-playground-error: invalid_input"));

    // The rejected request never touched the running gateway
    assert_eq!(harness.supervisor.current().await, Some(first));
    assert!(harness.supervisor.status().await.running);

    harness.stop().await;
}

#[tokio::test]
async fn test_restart_without_route_is_rejected() {
    let harness = Harness::start(unused_port().await).await;

    let response = post_form(harness.port, "/restart", DEFAULT_CONF, r#"{"proxy":{}}"#).await;
    assert!(status_line(&response).contains("400"), "Response: {}", response);
    assert!(response.contains("MISSING_ROUTE"));

    let response = post_form(harness.port, "/restart", DEFAULT_CONF, "{}").await;
    assert!(response.contains("MISSING_ROUTE"), "Response: {}", response);

    assert!(harness.supervisor.current().await.is_none());

    harness.stop().await;
}

#[tokio::test]
async fn test_restart_body_limit() {
    let harness = Harness::start_with(unused_port().await, |config| {
        config.server.max_body_bytes = 64;
    })
    .await;

    let big_def = format!(
        r#"{{"proxy":{{"listen_path":"/big/"}},"padding":"{}"}}"#,
        "x".repeat(256)
    );
    let response = post_form(harness.port, "/restart", DEFAULT_CONF, &big_def).await;
    assert!(status_line(&response).contains("413"), "Response: {}", response);
    assert!(response.contains("PAYLOAD_TOO_LARGE"));
    assert!(harness.supervisor.current().await.is_none());

    harness.stop().await;
}

#[tokio::test]
async fn test_wrong_method_and_unknown_path() {
    let harness = Harness::start(unused_port().await).await;

    let response = http_get(harness.port, "/restart").await.unwrap();
    assert!(status_line(&response).contains("405"), "Response: {}", response);

    let response = http_get(harness.port, "/nope").await.unwrap();
    assert!(status_line(&response).contains("404"), "Response: {}", response);

    harness.stop().await;
}

// ============================================================================
// Sharing
// ============================================================================

#[tokio::test]
async fn test_share_then_load() {
    let harness = Harness::start(unused_port().await).await;

    let response = post_form(harness.port, "/share", DEFAULT_CONF, TEST_DEF).await;
    assert!(status_line(&response).contains("200"), "Response: {}", response);
    let url = body(&response).to_string();
    assert!(url.starts_with(&format!("{}/s/", harness.base_url())), "URL: {}", url);

    // Sharing alone does not launch anything
    assert!(harness.supervisor.current().await.is_none());

    let name = share_name(&url).to_string();
    assert_eq!(name.len(), 10);
    assert!(harness.share_dir.join(format!("{}.json", name)).exists());

    // Same content, same name
    let again = post_form(harness.port, "/share", DEFAULT_CONF, TEST_DEF).await;
    assert_eq!(body(&again), url);

    let response = http_get(harness.port, &format!("/s/{}/", name)).await.unwrap();
    assert!(status_line(&response).contains("200"), "Response: {}", response);
    assert!(response.contains("&#34;listen_path&#34;:&#34;/test/&#34;"));
    assert_eq!(harness.supervisor.current().await.unwrap().id, 1);

    let output = wait_for_output(harness.port, "/test/").await;
    assert!(output.contains("/test/"), "Output: {}", output);

    harness.stop().await;
}

#[tokio::test]
async fn test_share_requires_route() {
    let harness = Harness::start(unused_port().await).await;

    let response = post_form(harness.port, "/share", DEFAULT_CONF, r#"{"proxy":{"listen_path":""}}"#).await;
    assert!(status_line(&response).contains("400"), "Response: {}", response);
    assert!(response.contains("MISSING_ROUTE"));
    assert!(!harness.share_dir.exists() || std::fs::read_dir(&harness.share_dir).unwrap().count() == 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_unknown_share_returns_404() {
    let harness = Harness::start(unused_port().await).await;

    let response = http_get(harness.port, "/s/K3oP9GySuj").await.unwrap();
    assert!(status_line(&response).contains("404"), "Response: {}", response);
    assert!(response.contains("NOT_FOUND"));

    let response = http_get(harness.port, "/s/..%2F..%2Fetc").await.unwrap();
    assert!(status_line(&response).contains("404"), "Response: {}", response);

    assert!(harness.supervisor.current().await.is_none());

    harness.stop().await;
}

#[tokio::test]
async fn test_legacy_share_without_conf_uses_default() {
    let harness = Harness::start(unused_port().await).await;

    write_legacy_share(&harness.share_dir, "legacy0001", TEST_DEF);
    let response = http_get(harness.port, "/s/legacy0001").await.unwrap();
    assert!(status_line(&response).contains("200"), "Response: {}", response);
    assert!(response.contains("&#34;listen_port&#34;:8080"));

    harness.stop().await;
}

fn write_legacy_share(dir: &Path, name: &str, def: &str) {
    std::fs::create_dir_all(dir).unwrap();
    let record = serde_json::json!({ "def": def }).to_string();
    std::fs::write(dir.join(format!("{}.json", name)), record).unwrap();
}

// ============================================================================
// Proxied traffic
// ============================================================================

#[tokio::test]
async fn test_proxy_forwards_to_gateway_port() {
    let upstream = MockUpstream::start().await;
    let harness = Harness::start(upstream.port).await;

    let response = http_get(harness.port, "/gw/test/get?x=1").await.unwrap();
    assert!(status_line(&response).contains("200"), "Response: {}", response);
    assert!(response.contains("X-Upstream: mock") || response.contains("x-upstream: mock"));
    assert!(response.contains("GET /test/get?x=1 HTTP/1.1"), "Response: {}", response);
    assert!(response.contains("forwarded-for: 127.0.0.1"), "Response: {}", response);

    let response = http_get(harness.port, "/gw").await.unwrap();
    assert!(response.contains("GET / HTTP/1.1"), "Response: {}", response);
    assert_eq!(upstream.hits(), 2);

    let status = http_get(harness.port, "/status").await.unwrap();
    assert!(status.contains("\"total_requests\":2"), "Status: {}", status);
    assert!(status.contains("\"failed_requests\":0"), "Status: {}", status);

    harness.stop().await;
}

#[tokio::test]
async fn test_proxy_forwards_post_body() {
    let upstream = MockUpstream::start().await;
    let harness = Harness::start(upstream.port).await;

    let response = http_post(harness.port, "/gw/test/post", "application/json", r#"{"a":1}"#)
        .await
        .unwrap();
    assert!(status_line(&response).contains("200"), "Response: {}", response);
    assert!(response.contains("POST /test/post HTTP/1.1"), "Response: {}", response);

    harness.stop().await;
}

#[tokio::test]
async fn test_proxy_blocks_gateway_control_api() {
    let upstream = MockUpstream::start().await;
    let harness = Harness::start(upstream.port).await;

    let response = http_get(harness.port, "/gw/tyk/apis").await.unwrap();
    assert!(status_line(&response).contains("403"), "Response: {}", response);
    assert_eq!(body(&response), "no!");

    let response = http_get(harness.port, "/gw/tyk/reload/group").await.unwrap();
    assert_eq!(body(&response), "no!");
    assert_eq!(upstream.hits(), 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_proxy_without_gateway_fails_fast() {
    let harness = Harness::start(unused_port().await).await;

    let start = Instant::now();
    let response = http_get(harness.port, "/gw/foo").await.unwrap();
    assert!(status_line(&response).contains("502"), "Response: {}", response);
    assert!(response.contains("UPSTREAM_UNAVAILABLE"));
    assert!(start.elapsed() < Duration::from_secs(3), "took {:?}", start.elapsed());

    harness.stop().await;
}

#[tokio::test]
async fn test_proxy_timeout() {
    // Accepts connections but never answers
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = silent.local_addr().unwrap().port();
    let silent_handle = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = silent.accept().await {
            held.push(stream);
        }
    });

    let harness = Harness::start_with(port, |config| {
        config.proxy.request_timeout_secs = 1;
    })
    .await;

    let start = Instant::now();
    let response = http_get(harness.port, "/gw/slow").await.unwrap();
    assert!(status_line(&response).contains("504"), "Response: {}", response);
    assert!(response.contains("REQUEST_TIMEOUT"));
    assert!(start.elapsed() < Duration::from_secs(4), "took {:?}", start.elapsed());

    harness.stop().await;
    silent_handle.abort();
}

// ============================================================================
// Concurrency
// ============================================================================

#[cfg(unix)]
#[tokio::test]
async fn test_concurrent_restarts_over_http() {
    let harness = Harness::start(unused_port().await).await;

    let mut handles = Vec::new();
    for i in 0..5 {
        let port = harness.port;
        handles.push(tokio::spawn(async move {
            let def = format!(r#"{{"proxy":{{"listen_path":"/gen{}/"}}}}"#, i);
            post_form(port, "/restart", DEFAULT_CONF, &def).await
        }));
    }
    for handle in handles {
        let response = handle.await.unwrap();
        assert!(status_line(&response).contains("200"), "Response: {}", response);
    }

    let current = harness.supervisor.current().await.unwrap();
    assert_eq!(current.id, 5);

    // Only one generation's definition ever shows up in the output
    let output = wait_for_output(harness.port, "/gen").await;
    let generations = (0..5)
        .filter(|i| output.contains(&format!("/gen{}/", i)))
        .count();
    assert_eq!(generations, 1, "Output: {}", output);

    harness.stop().await;
}
