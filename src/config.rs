use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the playground
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Front server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// How the managed gateway process is launched
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Reverse proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Share store settings
    #[serde(default)]
    pub share: ShareConfig,

    /// Location of the default configuration pair
    #[serde(default)]
    pub defaults: DefaultsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the front server (default: 8081)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Externally reachable base URL used in returned links.
    /// Derived from bind and port when unset.
    pub public_url: Option<String>,

    /// Maximum accepted request body size for control-plane requests
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Optional page template replacing the built-in edit form
    pub page_template: Option<String>,
}

impl ServerConfig {
    /// Base URL printed to users and prefixed to returned links
    pub fn public_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                let host = if self.bind == "0.0.0.0" || self.bind == "::" {
                    "localhost"
                } else {
                    self.bind.as_str()
                };
                format!("http://{}:{}", host, self.port)
            }
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            public_url: None,
            max_body_bytes: default_max_body_bytes(),
            page_template: None,
        }
    }
}

/// Launch settings for the supervised gateway process
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the playground's own
/// permissions. Protect the configuration file accordingly.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Gateway binary to execute
    #[serde(default = "default_gateway_command")]
    pub command: String,

    /// Arguments passed to the gateway
    #[serde(default = "default_gateway_args")]
    pub args: Vec<String>,

    /// Working directory of the gateway; config files are written beneath it
    #[serde(default = "default_gateway_dir")]
    pub working_dir: String,

    /// Process config file, relative to the working directory
    #[serde(default = "default_conf_file")]
    pub conf_file: String,

    /// API definition file, relative to the working directory
    #[serde(default = "default_def_file")]
    pub def_file: String,

    /// Local port the gateway listens on
    #[serde(default = "default_upstream_port")]
    pub upstream_port: u16,

    /// Extra environment variables on top of the inherited environment
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Time between SIGTERM and SIGKILL when replacing the gateway
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_ms: u64,

    /// Maximum captured output per generation
    #[serde(default = "default_output_limit")]
    pub output_limit_bytes: usize,
}

impl GatewayConfig {
    /// Create a gateway config for the given command with defaults elsewhere
    pub fn command(command: &str, working_dir: &str) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            working_dir: working_dir.to_string(),
            ..Self::default()
        }
    }

    /// Set arguments (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn conf_path(&self) -> PathBuf {
        Path::new(&self.working_dir).join(&self.conf_file)
    }

    pub fn def_path(&self) -> PathBuf {
        Path::new(&self.working_dir).join(&self.def_file)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.command.trim().is_empty() {
            return Err("gateway: 'command' must not be empty".to_string());
        }
        if self.conf_file.is_empty() || self.def_file.is_empty() {
            return Err("gateway: 'conf_file' and 'def_file' must not be empty".to_string());
        }
        if self.conf_file == self.def_file {
            return Err("gateway: 'conf_file' and 'def_file' must differ".to_string());
        }
        if self.upstream_port == 0 {
            return Err("gateway: 'upstream_port' must be greater than 0".to_string());
        }
        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            command: default_gateway_command(),
            args: default_gateway_args(),
            working_dir: default_gateway_dir(),
            conf_file: default_conf_file(),
            def_file: default_def_file(),
            upstream_port: default_upstream_port(),
            env: HashMap::new(),
            shutdown_grace_period_ms: default_shutdown_grace_period(),
            output_limit_bytes: default_output_limit(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// External path prefix that is forwarded to the gateway
    #[serde(default = "default_proxy_prefix")]
    pub prefix: String,

    /// First path segment after the prefix that is never forwarded
    /// (the gateway's own control API). Empty disables the check.
    #[serde(default = "default_blocked_segment")]
    pub blocked_segment: String,

    /// Max time to wait for the gateway to answer
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Max time to wait for a connection to the gateway
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Maximum idle upstream connections (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle upstream connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Prefix without a trailing slash, e.g. `/gw`
    pub fn normalized_prefix(&self) -> &str {
        self.prefix.trim_end_matches('/')
    }

    pub fn validate(&self) -> Result<(), String> {
        let prefix = self.normalized_prefix();
        if !prefix.starts_with('/') || prefix.len() < 2 {
            return Err(format!(
                "proxy: 'prefix' must be an absolute path below the root, got '{}'",
                self.prefix
            ));
        }
        if self.blocked_segment.contains('/') {
            return Err("proxy: 'blocked_segment' must be a single path segment".to_string());
        }
        Ok(())
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            prefix: default_proxy_prefix(),
            blocked_segment: default_blocked_segment(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ShareConfig {
    /// Directory holding shared configuration records
    #[serde(default = "default_share_dir")]
    pub dir: String,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            dir: default_share_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DefaultsConfig {
    /// Default gateway process config
    #[serde(default = "default_default_conf")]
    pub conf_path: String,

    /// Default API definition
    #[serde(default = "default_default_def")]
    pub def_path: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            conf_path: default_default_conf(),
            def_path: default_default_def(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8081
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_gateway_command() -> String {
    "tyk".to_string()
}

fn default_gateway_args() -> Vec<String> {
    vec!["--conf=conf.json".to_string()]
}

fn default_gateway_dir() -> String {
    "gateway".to_string()
}

fn default_conf_file() -> String {
    "conf.json".to_string()
}

fn default_def_file() -> String {
    "apps/test.json".to_string()
}

fn default_upstream_port() -> u16 {
    8080
}

fn default_shutdown_grace_period() -> u64 {
    2000 // 2 seconds between SIGTERM and SIGKILL
}

fn default_output_limit() -> usize {
    1024 * 1024
}

fn default_proxy_prefix() -> String {
    "/gw".to_string()
}

fn default_blocked_segment() -> String {
    "tyk".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_share_dir() -> String {
    "shares".to_string()
}

fn default_default_conf() -> String {
    "default/conf.json".to_string()
}

fn default_default_def() -> String {
    "default/def.json".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.gateway.validate() {
            errors.push(e);
        }
        if let Err(e) = self.proxy.validate() {
            errors.push(e);
        }
        if self.share.dir.is_empty() {
            errors.push("share: 'dir' must not be empty".to_string());
        }
        if self.server.max_body_bytes == 0 {
            errors.push("server: 'max_body_bytes' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
