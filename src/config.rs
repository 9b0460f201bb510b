//! Configuration structures and loading logic

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::grpc::director::split_method;

/// Fully-qualified method whose response carries a download URL to rewrite
pub const DOWNLOAD_URL_METHOD: &str = "/relay.config.v1.ConfigFileService/GetFileDownloadUrl";

/// Path prefix of the proxy's own download-redirection endpoint
pub const DEFAULT_DOWNLOAD_PREFIX: &str = "/download-proxy";

/// Main proxy configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address the gRPC frontend listens on
    pub grpc_addr: SocketAddr,
    /// Address of the admin HTTP endpoint (health, metrics, pool stats)
    pub admin_addr: SocketAddr,
    /// Externally reachable host:port substituted into rewritten download URLs
    pub external_address: String,
    pub external_scheme: String,
    pub download_prefix: String,
    pub intercepted_method: String,
    /// Services the proxy forwards; empty forwards everything
    pub allowed_services: Vec<String>,
    /// Per-call frame buffer in each direction
    pub stream_buffer: usize,
    pub max_message_size_mb: usize,
    /// How long shutdown waits for the frontend to drain before closing the pool
    pub shutdown_grace_secs: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<ServerTlsSettings>,

    pub backend: BackendConfig,
    pub pool: PoolConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
            admin_addr: default_admin_addr(),
            external_address: default_external_address(),
            external_scheme: default_external_scheme(),
            download_prefix: DEFAULT_DOWNLOAD_PREFIX.to_string(),
            intercepted_method: DOWNLOAD_URL_METHOD.to_string(),
            allowed_services: Vec::new(),
            stream_buffer: default_stream_buffer(),
            max_message_size_mb: default_max_message_size_mb(),
            shutdown_grace_secs: default_shutdown_grace(),
            tls: None,
            backend: BackendConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(addr) = std::env::var("GRPC_RELAY_GRPC_ADDR") {
            config.grpc_addr = addr.parse().context("Invalid GRPC_RELAY_GRPC_ADDR value")?;
        }
        if let Ok(addr) = std::env::var("GRPC_RELAY_ADMIN_ADDR") {
            config.admin_addr = addr
                .parse()
                .context("Invalid GRPC_RELAY_ADMIN_ADDR value")?;
        }
        if let Ok(address) = std::env::var("GRPC_RELAY_BACKEND_ADDRESS") {
            config.backend.address = address;
        }
        if let Ok(address) = std::env::var("GRPC_RELAY_EXTERNAL_ADDRESS") {
            config.external_address = address;
        }
        if let Ok(max_active) = std::env::var("GRPC_RELAY_POOL_MAX_ACTIVE") {
            config.pool.max_active = max_active
                .parse()
                .context("Invalid GRPC_RELAY_POOL_MAX_ACTIVE value")?;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.grpc_addr == self.admin_addr {
            anyhow::bail!(
                "gRPC and admin endpoints cannot share address {}",
                self.grpc_addr
            );
        }

        self.external_address
            .parse::<http::uri::Authority>()
            .with_context(|| format!("Invalid external address: {}", self.external_address))?;

        if self.external_scheme != "http" && self.external_scheme != "https" {
            anyhow::bail!(
                "External scheme must be http or https (got {})",
                self.external_scheme
            );
        }

        if !self.download_prefix.starts_with('/') || self.download_prefix.ends_with('/') {
            anyhow::bail!(
                "Download prefix must start with '/' and not end with '/' (got {})",
                self.download_prefix
            );
        }

        if split_method(&self.intercepted_method).is_none() {
            anyhow::bail!(
                "Intercepted method must look like /package.Service/Method (got {})",
                self.intercepted_method
            );
        }

        if self.allowed_services.iter().any(|s| s.is_empty()) {
            anyhow::bail!("Allowed service names cannot be empty");
        }

        if self.stream_buffer == 0 {
            anyhow::bail!("Stream buffer must be at least 1");
        }
        if self.max_message_size_mb == 0 {
            anyhow::bail!("Max message size must be at least 1MB");
        }
        if self.shutdown_grace_secs == 0 {
            anyhow::bail!("Shutdown grace period must be at least 1 second");
        }

        if let Some(tls) = &self.tls {
            ensure_file(&tls.cert_path, "TLS certificate")?;
            ensure_file(&tls.key_path, "TLS key")?;
            if let Some(ca) = &tls.client_ca_path {
                ensure_file(ca, "client CA")?;
            }
        }

        self.backend.validate()?;
        self.pool.validate()?;

        Ok(())
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size_mb * 1024 * 1024
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// TLS settings for the gRPC frontend
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServerTlsSettings {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// Require client certificates signed by this CA (mTLS)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ca_path: Option<PathBuf>,
}

/// The single upstream the proxy forwards to
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    /// host:port of the configuration backend
    pub address: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<BackendTlsSettings>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            address: default_backend_address(),
            tls: None,
        }
    }
}

impl BackendConfig {
    fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            anyhow::bail!("Backend address cannot be empty");
        }
        self.address
            .parse::<http::uri::Authority>()
            .with_context(|| format!("Invalid backend address: {}", self.address))?;

        if let Some(ca) = self.tls.as_ref().and_then(|tls| tls.ca_cert_path.as_ref()) {
            ensure_file(ca, "backend CA")?;
        }
        Ok(())
    }

    /// URI used to dial the backend
    pub fn uri(&self) -> String {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        format!("{}://{}", scheme, self.address)
    }
}

/// Backend TLS; webpki roots are trusted when no CA file is given
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BackendTlsSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert_path: Option<PathBuf>,
    /// Override the name checked against the backend certificate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// Backend connection pool limits
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle connections kept open between calls
    pub max_idle: usize,
    /// Hard ceiling on transport connections
    pub max_active: usize,
    /// Streams multiplexed on one connection before another is dialed
    pub max_concurrent_streams: usize,
    /// At the ceiling, oversubscribe the least-loaded connection instead of failing
    pub reuse: bool,
    pub dial_timeout_secs: u64,
    pub keepalive: KeepAliveConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: default_max_idle(),
            max_active: default_max_active(),
            max_concurrent_streams: default_max_concurrent_streams(),
            reuse: true,
            dial_timeout_secs: default_dial_timeout(),
            keepalive: KeepAliveConfig::default(),
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<()> {
        if self.max_active == 0 {
            anyhow::bail!("Pool max_active must be at least 1");
        }
        if self.max_idle > self.max_active {
            anyhow::bail!(
                "Pool max_idle ({}) cannot exceed max_active ({})",
                self.max_idle,
                self.max_active
            );
        }
        if self.max_concurrent_streams == 0 {
            anyhow::bail!("Pool max_concurrent_streams must be at least 1");
        }
        if self.dial_timeout_secs == 0 {
            anyhow::bail!("Pool dial timeout must be at least 1 second");
        }
        if self.keepalive.interval_secs == 0 || self.keepalive.timeout_secs == 0 {
            anyhow::bail!("Keep-alive interval and timeout must be at least 1 second");
        }
        Ok(())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

/// HTTP/2 keep-alive probing on every backend connection
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct KeepAliveConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    /// Probe even when no stream is open on the connection
    pub permit_without_stream: bool,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_keepalive_interval(),
            timeout_secs: default_keepalive_timeout(),
            permit_without_stream: true,
        }
    }
}

impl KeepAliveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn ensure_file(path: &Path, what: &str) -> Result<()> {
    if !path.is_file() {
        anyhow::bail!("{} file not found: {:?}", what, path);
    }
    Ok(())
}

// Default functions
fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8091))
}
fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9091))
}
fn default_external_address() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_external_scheme() -> String {
    "http".to_string()
}
fn default_stream_buffer() -> usize {
    64
}
fn default_max_message_size_mb() -> usize {
    16
}
fn default_shutdown_grace() -> u64 {
    30
}
fn default_backend_address() -> String {
    "127.0.0.1:8093".to_string()
}
fn default_max_idle() -> usize {
    2
}
fn default_max_active() -> usize {
    16
}
fn default_max_concurrent_streams() -> usize {
    512
}
fn default_dial_timeout() -> u64 {
    5
}
fn default_keepalive_interval() -> u64 {
    30
}
fn default_keepalive_timeout() -> u64 {
    10
}
