use crate::config::Config;
use crate::error::{json_error_response, ErrorCode, PlaygroundError};
use crate::page::PageTemplate;
use crate::pair::{ConfigurationPair, DefaultPair};
use crate::proxy::{Gateway, GatewayRoute};
use crate::route::extract_route_path;
use crate::share::ShareStore;
use crate::supervisor::Supervisor;
use http_body_util::{combinators::BoxBody, BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the playground
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

type FrontResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> FrontResponse {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> FrontResponse {
    response(status, "text/plain; charset=utf-8", body)
}

/// Everything a request handler needs. Shared by all connections.
pub struct Playground {
    supervisor: Arc<Supervisor>,
    shares: ShareStore,
    defaults: DefaultPair,
    gateway: Gateway,
    page: PageTemplate,
    public_url: String,
    max_body_bytes: usize,
}

impl Playground {
    pub fn new(
        config: &Config,
        supervisor: Arc<Supervisor>,
        shares: ShareStore,
        defaults: DefaultPair,
    ) -> Self {
        Self {
            gateway: Gateway::new(&config.proxy, config.gateway.upstream_port),
            supervisor,
            shares,
            defaults,
            page: PageTemplate::default(),
            public_url: config.server.public_url(),
            max_body_bytes: config.server.max_body_bytes,
        }
    }

    /// Replace the built-in page template
    pub fn with_page(mut self, page: PageTemplate) -> Self {
        self.page = page;
        self
    }

    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    /// GET /: relaunch with the default pair and show it
    async fn index(&self) -> FrontResponse {
        let pair = self.defaults.pair();
        match self.supervisor.restart(pair).await {
            Ok(generation) => {
                info!(generation = generation.id, "Gateway restarted with defaults");
                self.render(pair)
            }
            Err(e) => self.fail("Restart with defaults failed", e),
        }
    }

    /// POST /restart: relaunch with the submitted pair, answer with its URL
    async fn restart(&self, req: Request<Incoming>) -> FrontResponse {
        let pair = match self.read_pair(req).await {
            Ok(pair) => pair,
            Err(response) => return response,
        };
        let listen_path = match check_pair(&pair) {
            Ok(path) => path,
            Err(e) => return self.fail("Rejected configuration", e),
        };

        match self.supervisor.restart(&pair).await {
            Ok(generation) => {
                info!(generation = generation.id, listen_path = %listen_path, "Gateway restarted");
                text_response(StatusCode::OK, self.route_url(&listen_path))
            }
            Err(e) => self.fail("Restart failed", e),
        }
    }

    /// POST /share: persist the submitted pair, answer with its share URL
    async fn share(&self, req: Request<Incoming>) -> FrontResponse {
        let pair = match self.read_pair(req).await {
            Ok(pair) => pair,
            Err(response) => return response,
        };
        if let Err(e) = check_pair(&pair) {
            return self.fail("Rejected configuration", e);
        }

        match self.shares.save(&pair).await {
            Ok(name) => text_response(StatusCode::OK, format!("{}/s/{}", self.public_url, name)),
            Err(e) => self.fail("Share failed", e),
        }
    }

    /// GET /s/{name}: relaunch with a shared pair and show it
    async fn load_shared(&self, name: &str) -> FrontResponse {
        let pair = match self.shares.load(name).await {
            Ok(pair) => pair,
            Err(e) => return self.fail("Shared configuration unavailable", e),
        };
        if let Err(e) = check_pair(&pair) {
            return self.fail("Shared configuration is unusable", e);
        }

        match self.supervisor.restart(&pair).await {
            Ok(generation) => {
                info!(generation = generation.id, name, "Gateway restarted from share");
                self.render(&pair)
            }
            Err(e) => self.fail("Restart from share failed", e),
        }
    }

    async fn output(&self) -> FrontResponse {
        text_response(StatusCode::OK, self.supervisor.current_output().await)
    }

    async fn status(&self) -> FrontResponse {
        let status = self.supervisor.status().await;
        let stats = self.gateway.upstream().stats();
        let body = serde_json::json!({
            "name": PKG_NAME,
            "version": VERSION,
            "gateway": status,
            "proxy": {
                "upstream_port": self.gateway.upstream().port(),
                "total_requests": stats.get_total_requests(),
                "failed_requests": stats.get_failed_requests(),
            },
        });
        response(StatusCode::OK, "application/json", body.to_string())
    }

    fn render(&self, pair: &ConfigurationPair) -> FrontResponse {
        response(
            StatusCode::OK,
            "text/html; charset=utf-8",
            self.page.render(&self.public_url, pair),
        )
    }

    fn route_url(&self, listen_path: &str) -> String {
        format!("{}{}{}", self.public_url, self.gateway.prefix(), listen_path)
    }

    fn fail(&self, context: &str, e: PlaygroundError) -> FrontResponse {
        match e.code().status_code() {
            status if status.is_server_error() => error!(error = %e, "{}", context),
            _ => warn!(error = %e, "{}", context),
        }
        e.into_response()
    }

    /// Read and decode a bounded request body into a pair
    async fn read_pair(&self, req: Request<Incoming>) -> Result<ConfigurationPair, FrontResponse> {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let body = match Limited::new(req.into_body(), self.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return Err(json_error_response(
                    ErrorCode::PayloadTooLarge,
                    format!("request body exceeds {} bytes", self.max_body_bytes),
                ));
            }
            Err(e) => {
                return Err(json_error_response(
                    ErrorCode::InvalidInput,
                    format!("failed to read request body: {}", e),
                ));
            }
        };

        ConfigurationPair::from_body(content_type.as_deref(), &body)
            .map_err(|e| self.fail("Undecodable request body", e))
    }
}

/// Syntax check plus route extraction; nothing is launched without a route
fn check_pair(pair: &ConfigurationPair) -> Result<String, PlaygroundError> {
    pair.validate()?;
    extract_route_path(&pair.def)
}

/// Control-plane paths are matched without trailing slashes
fn normalize_path(path: &str) -> &str {
    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

/// HTTP front: the edit page, the control endpoints and the proxied traffic
pub struct FrontServer {
    bind_addr: SocketAddr,
    playground: Arc<Playground>,
    shutdown_rx: watch::Receiver<bool>,
}

impl FrontServer {
    pub fn new(
        bind_addr: SocketAddr,
        playground: Arc<Playground>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            playground,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, public_url = %self.playground.public_url, "Playground listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let playground = Arc::clone(&self.playground);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, playground).await {
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
                        info!("Front server shutting down");
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
    playground: Arc<Playground>,
) -> anyhow::Result<()> {
    let _ = stream.set_nodelay(true);
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let playground = Arc::clone(&playground);
        async move { handle_request(req, addr, playground).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    client_addr: SocketAddr,
    playground: Arc<Playground>,
) -> Result<FrontResponse, hyper::Error> {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = route_request(req, client_addr, &playground).await;

    info!(
        %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Request handled"
    );

    Ok(response)
}

async fn route_request(
    req: Request<Incoming>,
    client_addr: SocketAddr,
    playground: &Playground,
) -> FrontResponse {
    // Proxied traffic sees the raw path, any method
    if playground.gateway.route(req.uri().path(), None) != GatewayRoute::NotMatched {
        return playground.gateway.forward(req, client_addr).await;
    }

    let method = req.method().clone();
    let path = normalize_path(req.uri().path()).to_string();

    match (&method, path.as_str()) {
        (&Method::GET, "/") => playground.index().await,
        (&Method::POST, "/restart") => playground.restart(req).await,
        (&Method::POST, "/share") => playground.share(req).await,
        (&Method::GET, "/output") => playground.output().await,
        (&Method::GET, "/status") => playground.status().await,
        (&Method::GET, "/health") => text_response(StatusCode::OK, "ok"),
        (&Method::GET, p) if p.starts_with("/s/") => {
            let name = &p["/s/".len()..];
            if name.is_empty() || name.contains('/') {
                json_error_response(ErrorCode::NotFound, "not found")
            } else {
                playground.load_shared(name).await
            }
        }
        (_, "/" | "/restart" | "/share" | "/output" | "/status" | "/health") => {
            text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }
        _ => json_error_response(ErrorCode::NotFound, "not found"),
    }
}
