//! Gateway configuration.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::transport::DEFAULT_BUFFER_SIZE;

/// Smallest accepted relay buffer.
pub const MIN_BUFFER_SIZE: usize = 1024;

/// One named listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardConfig {
    /// Unique forward name
    pub name: String,
    /// Listen URL: `socks://`, `proxy://`, `ws://` or `tcp://` plus host:port
    pub listen: String,
    /// Router template; `${HOST}` is replaced by the requested target
    pub router: String,
}

impl ForwardConfig {
    /// Create a forward entry.
    pub fn new(
        name: impl Into<String>,
        listen: impl Into<String>,
        router: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            listen: listen.into(),
            router: router.into(),
        }
    }
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Relay buffer size in bytes
    pub buffer_size: usize,
    /// Level filter for the gateway logger
    pub log_level: LevelFilter,
    /// Idle timeout applied to accepted connections
    pub idle_timeout: Option<Duration>,
    /// Listeners to start
    pub forwards: Vec<ForwardConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            log_level: LevelFilter::INFO,
            idle_timeout: None,
            forwards: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Configuration with one forward of each kind on loopback.
    pub fn sample() -> Self {
        Self {
            forwards: vec![
                ForwardConfig::new("socks", "socks://127.0.0.1:1080", "tcp://${HOST}"),
                ForwardConfig::new("proxy", "proxy://127.0.0.1:8080", "tcp://${HOST}"),
                ForwardConfig::new("tunnel", "ws://127.0.0.1:8081", "tcp://${HOST}"),
                ForwardConfig::new("ssh", "tcp://127.0.0.1:2222", "tcp://10.0.0.2:22"),
            ],
            ..Self::default()
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(format!(
                "buffer_size must be at least {} bytes",
                MIN_BUFFER_SIZE
            ));
        }
        let mut names = HashSet::new();
        for forward in &self.forwards {
            if forward.name.is_empty() {
                return Err("forward name cannot be empty".into());
            }
            if !names.insert(forward.name.as_str()) {
                return Err(format!("duplicate forward name {:?}", forward.name));
            }
            if forward.router.is_empty() {
                return Err(format!("forward {:?}: router cannot be empty", forward.name));
            }
            listen_addr(&forward.listen)
                .map_err(|e| format!("forward {:?}: {}", forward.name, e))?;
        }
        Ok(())
    }
}

/// Listen URL schemes a forward can be started with.
pub const LISTEN_SCHEMES: [&str; 6] = ["socks", "proxy", "ws", "tcp", "tcp4", "tcp6"];

/// Scheme and bind address (`host:port`) of a listen URL.
pub fn listen_addr(listen: &str) -> Result<(String, String), String> {
    let url = Url::parse(listen).map_err(|e| format!("invalid listen url {:?}: {}", listen, e))?;
    if !LISTEN_SCHEMES.contains(&url.scheme()) {
        return Err(format!(
            "unsupported listen scheme {:?} in {:?}",
            url.scheme(),
            listen
        ));
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| format!("listen url {:?} has no host", listen))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| format!("listen url {:?} has no port", listen))?;
    Ok((url.scheme().to_string(), format!("{}:{}", host, port)))
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_log_level() -> String {
    "info".into()
}

/// Configuration file format for serialization.
#[derive(Serialize, Deserialize)]
pub struct GatewayConfigFile {
    /// Relay buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Log level: off, error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Idle timeout in seconds (0 disables)
    #[serde(default)]
    pub idle_timeout_secs: u64,
    /// Listeners to start
    #[serde(default)]
    pub forwards: Vec<ForwardConfig>,
}

impl GatewayConfigFile {
    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<GatewayConfig, String> {
        let log_level = LevelFilter::from_str(&self.log_level)
            .map_err(|e| format!("invalid log_level {:?}: {}", self.log_level, e))?;

        Ok(GatewayConfig {
            buffer_size: self.buffer_size,
            log_level,
            idle_timeout: match self.idle_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            forwards: self.forwards.clone(),
        })
    }

    /// Create from runtime configuration.
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            buffer_size: config.buffer_size,
            log_level: config.log_level.to_string().to_lowercase(),
            idle_timeout_secs: config.idle_timeout.map(|d| d.as_secs()).unwrap_or(0),
            forwards: config.forwards.clone(),
        }
    }
}
