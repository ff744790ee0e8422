use gwplay::config::Config;
use gwplay::front::{FrontServer, Playground, PKG_NAME, VERSION};
use gwplay::page::PageTemplate;
use gwplay::pair::DefaultPair;
use gwplay::share::ShareStore;
use gwplay::supervisor::Supervisor;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "playground.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gwplay=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match &explicit_path {
        Some(path) => Config::load(path).map_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to load configuration");
            e
        })?,
        None if PathBuf::from(DEFAULT_CONFIG_PATH).exists() => Config::load(DEFAULT_CONFIG_PATH)?,
        None => {
            info!(path = DEFAULT_CONFIG_PATH, "No configuration file, using defaults");
            Config::default()
        }
    };

    print_startup_banner(&config);

    let defaults = DefaultPair::load(&config.defaults.conf_path, &config.defaults.def_path)?;
    info!(
        conf = %config.defaults.conf_path,
        def = %config.defaults.def_path,
        "Default configuration loaded"
    );

    let page = match &config.server.page_template {
        Some(path) => {
            info!(path = %path, "Using custom page template");
            PageTemplate::load(path)?
        }
        None => PageTemplate::default(),
    };

    let shares = ShareStore::new(&config.share.dir).with_fallback_conf(defaults.conf());
    let supervisor = Arc::new(Supervisor::new(config.gateway.clone()));

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let playground = Arc::new(
        Playground::new(&config, Arc::clone(&supervisor), shares, defaults).with_page(page),
    );
    let server = FrontServer::new(bind_addr, playground, shutdown_rx);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Front server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping gateway...");
    supervisor.shutdown().await;

    if tokio::time::timeout(Duration::from_secs(5), server_handle)
        .await
        .is_err()
    {
        warn!("Front server did not stop in time");
    }

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting playground");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        public_url = %config.server.public_url(),
        max_body_bytes = config.server.max_body_bytes,
        "Server configuration"
    );
    info!(
        command = %config.gateway.command,
        args = ?config.gateway.args,
        working_dir = %config.gateway.working_dir,
        upstream_port = config.gateway.upstream_port,
        shutdown_grace_period_ms = config.gateway.shutdown_grace_period_ms,
        "Gateway settings"
    );
    info!(
        prefix = %config.proxy.normalized_prefix(),
        blocked_segment = %config.proxy.blocked_segment,
        request_timeout_secs = config.proxy.request_timeout_secs,
        "Proxy settings"
    );
    info!(dir = %config.share.dir, "Share store");
}
