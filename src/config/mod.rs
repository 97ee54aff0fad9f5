//! Configuration module

use crate::common::TimeoutPolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

/// Header budget used when `max-header-bytes` is 0 (1 MiB).
pub const DEFAULT_MAX_HEADER_BYTES: usize = 1 << 20;

/// Grace period for in-flight sessions after shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 30_000;

/// Redirect status used when none is configured.
pub const DEFAULT_REDIRECT_STATUS: u16 = 307;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Listen address
    pub listen: String,

    /// Certificate and key for the TLS side
    pub tls: Option<TlsConfig>,

    /// Header budget per request, 0 = 1 MiB
    pub max_header_bytes: usize,

    /// Deadline for reading a request head, 0 = inherit from read-timeout
    pub read_header_timeout_ms: u64,

    /// Deadline for reading a request body, 0 = none
    pub read_timeout_ms: u64,

    /// Deadline for flushing a response, 0 = none
    pub write_timeout_ms: u64,

    /// Keep-alive idle deadline, 0 = inherit from read-timeout
    pub idle_timeout_ms: u64,

    /// Status code of the default HTTPS redirect
    pub redirect_status_code: u16,

    /// How the redirect target treats the port of the Host header
    pub redirect_port: RedirectPort,

    /// What to do with connections whose first byte is neither TLS nor HTTP
    pub unknown_protocol: UnknownProtocolPolicy,

    /// When listening on port 443, also answer plaintext HTTP on port 80
    pub listen_80_redirect_to_443: bool,

    /// How long shutdown waits for in-flight sessions, 0 = until they end
    pub shutdown_timeout_ms: u64,

    /// Log level
    pub log_level: String,
}

impl Config {
    /// Load configuration from file (synchronous)
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from file (async)
    pub async fn load_async<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        Self::from_str(&content)
    }

    /// Load from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.listen.trim().is_empty() {
            return Err(Error::config("listen address must not be empty"));
        }

        if !matches!(self.redirect_status_code, 301 | 302 | 303 | 307 | 308) {
            return Err(Error::config(format!(
                "redirect-status-code {} is not a redirect status",
                self.redirect_status_code
            )));
        }

        if let Some(tls) = &self.tls {
            if tls.cert.is_empty() || tls.key.is_empty() {
                return Err(Error::config("tls requires both cert and key"));
            }
        }

        Ok(())
    }

    /// Header budget with the protocol default applied.
    pub fn effective_max_header_bytes(&self) -> usize {
        if self.max_header_bytes == 0 {
            DEFAULT_MAX_HEADER_BYTES
        } else {
            self.max_header_bytes
        }
    }

    pub fn timeouts(&self) -> TimeoutPolicy {
        TimeoutPolicy::from_millis(
            self.read_header_timeout_ms,
            self.read_timeout_ms,
            self.write_timeout_ms,
            self.idle_timeout_ms,
        )
    }

    /// Drain limit for in-flight sessions, `None` when unbounded.
    pub fn shutdown_grace(&self) -> Option<Duration> {
        (self.shutdown_timeout_ms > 0).then(|| Duration::from_millis(self.shutdown_timeout_ms))
    }

    /// Save configuration to file
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content).await?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: "0.0.0.0:443".to_string(),
            tls: None,
            max_header_bytes: 0,
            read_header_timeout_ms: 0,
            read_timeout_ms: 0,
            write_timeout_ms: 0,
            idle_timeout_ms: 0,
            redirect_status_code: DEFAULT_REDIRECT_STATUS,
            redirect_port: RedirectPort::default(),
            unknown_protocol: UnknownProtocolPolicy::default(),
            listen_80_redirect_to_443: false,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            log_level: "info".to_string(),
        }
    }
}

/// TLS certificate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain
    pub cert: String,

    /// PEM private key
    pub key: String,
}

/// Port handling for the HTTPS redirect target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RedirectPort {
    /// Drop an explicit `:80`, keep any other port
    #[default]
    StripDefault,
    /// Add `:80` when the host carries no port
    ForceSamePort,
    /// Use the Host header verbatim
    Keep,
}

/// Policy for a first byte that is neither a TLS record type nor an HTTP method
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnknownProtocolPolicy {
    /// Hand the bytes to the TLS layer and let the handshake fail
    #[default]
    PassThrough,
    /// Close the connection with a protocol error
    Reject,
}
