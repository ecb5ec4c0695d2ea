//! Server configuration and command-line arguments.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

/// Runtime configuration for the HTTP front.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP server to.
    pub bind_addr: SocketAddr,
    /// Bearer token for the admin routes. `None` disables the admin API.
    pub admin_token: Option<String>,
    /// Take the client key from `X-Forwarded-For` instead of the peer address.
    pub trust_forwarded: bool,
    /// CORS allowed origins (empty means all).
    pub cors_origins: Vec<String>,
    /// Interval between background sweeps of idle admission state.
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            admin_token: None,
            trust_forwarded: false,
            cors_origins: Vec::new(),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl ServerConfig {
    /// Create a new configuration with the specified bind address.
    #[must_use]
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Self::default()
        }
    }

    /// Require a bearer token on the admin routes.
    #[must_use]
    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }

    /// Trust `X-Forwarded-For` for the client key.
    #[must_use]
    pub const fn with_trust_forwarded(mut self, trust: bool) -> Self {
        self.trust_forwarded = trust;
        self
    }

    /// Add a CORS allowed origin.
    #[must_use]
    pub fn with_cors_origin(mut self, origin: impl Into<String>) -> Self {
        self.cors_origins.push(origin.into());
        self
    }

    /// Set the sweep interval.
    #[must_use]
    pub const fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// TuneHub admission gate.
#[derive(Parser, Debug, Clone)]
#[command(name = "tunehub-server")]
#[command(version, about, long_about = None)]
pub struct ServerArgs {
    /// Address to listen on.
    #[arg(long, env = "TUNEHUB_BIND", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// JSON file with admission thresholds. Defaults apply when omitted.
    #[arg(long, env = "TUNEHUB_ADMISSION_CONFIG")]
    pub admission_config: Option<PathBuf>,

    /// Append access-log records to this JSONL file.
    #[arg(long, env = "TUNEHUB_ACCESS_LOG")]
    pub access_log: Option<PathBuf>,

    /// Persist bans to this JSON file. Bans are in-memory when omitted.
    #[arg(long, env = "TUNEHUB_BANS_PATH")]
    pub bans_path: Option<PathBuf>,

    /// Bearer token for /admin routes. The admin API is off without one.
    #[arg(long, env = "TUNEHUB_ADMIN_TOKEN", hide_env_values = true)]
    pub admin_token: Option<String>,

    /// Use the first X-Forwarded-For hop as the client address.
    #[arg(long, env = "TUNEHUB_TRUST_FORWARDED")]
    pub trust_forwarded: bool,

    /// Log output format.
    #[arg(long, env = "TUNEHUB_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// CORS allowed origin (repeatable).
    #[arg(long = "cors-origin")]
    pub cors_origins: Vec<String>,

    /// Seconds between sweeps of idle rate-limit and lockout state.
    #[arg(long, default_value_t = 300)]
    pub sweep_interval_secs: u64,
}

impl ServerArgs {
    /// The runtime configuration these arguments describe.
    #[must_use]
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind,
            admin_token: self.admin_token.clone().filter(|t| !t.is_empty()),
            trust_forwarded: self.trust_forwarded,
            cors_origins: self.cors_origins.clone(),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
        }
    }
}
