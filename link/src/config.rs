//! File-based configuration for embedding applications.
//!
//! ```toml
//! [server]
//! base_url = "http://controls.example.org:8080"
//!
//! [connection]
//! reconnect_delay_ms = 1000
//! max_reconnect_delay_ms = 30000
//!
//! [buffer]
//! flush_interval_ms = 500
//!
//! [heartbeat]
//! interval_ms = 2000
//! ```
//!
//! Every section except `server` is optional. `PVLINK_*` environment
//! variables override file values.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::{
    error::{PvLinkError, Result},
    heartbeat::DEFAULT_HEARTBEAT_PATH,
    models::ConnectionOptions,
    query::DEFAULT_LIVE_VALUES_PATH,
    timeouts::PvLinkTimeouts,
};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub server: ServerSettings,
    #[serde(default)]
    pub connection: ConnectionOptions,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub buffer: BufferSettings,
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,
    #[serde(default)]
    pub staleness: StalenessSettings,
    #[serde(default)]
    pub fallback: FallbackSettings,
}

/// Backend location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// `http(s)://host[:port]` of the backend.
    pub base_url: String,
    #[serde(default = "default_heartbeat_path")]
    pub heartbeat_path: String,
    #[serde(default = "default_live_values_path")]
    pub live_values_path: String,
}

/// Timeouts in milliseconds; `0` disables the ones that allow it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_pong_timeout_ms")]
    pub pong_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferSettings {
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StalenessSettings {
    /// Samples older than this are shown as stale.
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: f64,
}

/// REST polling used while the live channel is down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_fallback_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_heartbeat_path() -> String {
    DEFAULT_HEARTBEAT_PATH.to_string()
}

fn default_live_values_path() -> String {
    DEFAULT_LIVE_VALUES_PATH.to_string()
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_send_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    2_000
}

fn default_keepalive_interval_ms() -> u64 {
    15_000
}

fn default_pong_timeout_ms() -> u64 {
    5_000
}

fn default_flush_interval_ms() -> u64 {
    500
}

fn default_heartbeat_interval_ms() -> u64 {
    2_000
}

fn default_stale_threshold_secs() -> f64 {
    60.0
}

fn default_fallback_poll_interval_ms() -> u64 {
    5_000
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connection_timeout_ms: default_connection_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            pong_timeout_ms: default_pong_timeout_ms(),
        }
    }
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl Default for StalenessSettings {
    fn default() -> Self {
        Self {
            stale_threshold_secs: default_stale_threshold_secs(),
        }
    }
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_ms: default_fallback_poll_interval_ms(),
        }
    }
}

impl TimeoutSettings {
    pub fn to_timeouts(&self) -> PvLinkTimeouts {
        PvLinkTimeouts::builder()
            .connection_timeout(Duration::from_millis(self.connection_timeout_ms))
            .send_timeout(Duration::from_millis(self.send_timeout_ms))
            .request_timeout(Duration::from_millis(self.request_timeout_ms))
            .heartbeat_timeout(Duration::from_millis(self.heartbeat_timeout_ms))
            .keepalive_interval(Duration::from_millis(self.keepalive_interval_ms))
            .pong_timeout(Duration::from_millis(self.pong_timeout_ms))
            .build()
    }
}

impl LinkConfig {
    /// Configuration with defaults for everything but the backend URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            server: ServerSettings {
                base_url: base_url.into(),
                heartbeat_path: default_heartbeat_path(),
                live_values_path: default_live_values_path(),
            },
            connection: ConnectionOptions::default(),
            timeouts: TimeoutSettings::default(),
            buffer: BufferSettings::default(),
            heartbeat: HeartbeatSettings::default(),
            staleness: StalenessSettings::default(),
            fallback: FallbackSettings::default(),
        }
    }

    /// Load from a TOML file, apply `PVLINK_*` overrides, then validate.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            PvLinkError::ConfigurationError(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let mut config = Self::parse(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML without overrides or validation.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| {
            PvLinkError::ConfigurationError(format!("Failed to parse config file: {}", e))
        })
    }

    /// Apply environment variable overrides.
    ///
    /// - `PVLINK_BASE_URL`: server.base_url
    /// - `PVLINK_WS_URL`: connection.ws_url
    /// - `PVLINK_AUTO_RECONNECT`: connection.auto_reconnect
    /// - `PVLINK_MAX_RECONNECT_ATTEMPTS`: connection.max_reconnect_attempts
    ///   (empty or `none` for unlimited)
    /// - `PVLINK_FLUSH_INTERVAL_MS`: buffer.flush_interval_ms
    /// - `PVLINK_HEARTBEAT_INTERVAL_MS`: heartbeat.interval_ms
    /// - `PVLINK_STALE_THRESHOLD_SECS`: staleness.stale_threshold_secs
    /// - `PVLINK_POLLING_FALLBACK`: fallback.enabled
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Same as [`apply_env_overrides`](Self::apply_env_overrides) with a
    /// custom variable source.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("PVLINK_BASE_URL") {
            self.server.base_url = url;
        }
        if let Some(url) = lookup("PVLINK_WS_URL") {
            self.connection.ws_url = Some(url).filter(|u| !u.trim().is_empty());
        }
        if let Some(val) = lookup("PVLINK_AUTO_RECONNECT") {
            self.connection.auto_reconnect = parse_bool("PVLINK_AUTO_RECONNECT", &val)?;
        }
        if let Some(val) = lookup("PVLINK_MAX_RECONNECT_ATTEMPTS") {
            let val = val.trim();
            self.connection.max_reconnect_attempts =
                if val.is_empty() || val.eq_ignore_ascii_case("none") {
                    None
                } else {
                    Some(parse_num("PVLINK_MAX_RECONNECT_ATTEMPTS", val)?)
                };
        }
        if let Some(val) = lookup("PVLINK_FLUSH_INTERVAL_MS") {
            self.buffer.flush_interval_ms = parse_num("PVLINK_FLUSH_INTERVAL_MS", &val)?;
        }
        if let Some(val) = lookup("PVLINK_HEARTBEAT_INTERVAL_MS") {
            self.heartbeat.interval_ms = parse_num("PVLINK_HEARTBEAT_INTERVAL_MS", &val)?;
        }
        if let Some(val) = lookup("PVLINK_STALE_THRESHOLD_SECS") {
            self.staleness.stale_threshold_secs = parse_num("PVLINK_STALE_THRESHOLD_SECS", &val)?;
        }
        if let Some(val) = lookup("PVLINK_POLLING_FALLBACK") {
            self.fallback.enabled = parse_bool("PVLINK_POLLING_FALLBACK", &val)?;
        }
        Ok(())
    }

    /// Validate configuration settings.
    pub fn validate(&self) -> Result<()> {
        let base_url = self.server.base_url.trim();
        if base_url.is_empty() {
            return Err(PvLinkError::ConfigurationError("server.base_url cannot be empty".to_string()));
        }
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(PvLinkError::ConfigurationError(format!(
                "server.base_url must start with http:// or https:// (got '{}')",
                base_url
            )));
        }
        if self.buffer.flush_interval_ms == 0 {
            return Err(PvLinkError::ConfigurationError("buffer.flush_interval_ms cannot be 0".to_string()));
        }
        if self.heartbeat.interval_ms == 0 {
            return Err(PvLinkError::ConfigurationError("heartbeat.interval_ms cannot be 0".to_string()));
        }
        if self.fallback.enabled && self.fallback.poll_interval_ms == 0 {
            return Err(PvLinkError::ConfigurationError(
                "fallback.poll_interval_ms cannot be 0 when the fallback is enabled".to_string(),
            ));
        }
        if !(self.staleness.stale_threshold_secs.is_finite() && self.staleness.stale_threshold_secs > 0.0) {
            return Err(PvLinkError::ConfigurationError(format!(
                "staleness.stale_threshold_secs must be positive (got {})",
                self.staleness.stale_threshold_secs
            )));
        }
        if self.connection.reconnect_delay_ms == 0 {
            return Err(PvLinkError::ConfigurationError(
                "connection.reconnect_delay_ms cannot be 0".to_string(),
            ));
        }
        if self.connection.reconnect_delay_ms > self.connection.max_reconnect_delay_ms {
            return Err(PvLinkError::ConfigurationError(format!(
                "connection.reconnect_delay_ms ({}) cannot exceed max_reconnect_delay_ms ({})",
                self.connection.reconnect_delay_ms, self.connection.max_reconnect_delay_ms
            )));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.buffer.flush_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat.interval_ms)
    }

    pub fn fallback_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fallback.poll_interval_ms)
    }
}

fn parse_bool(key: &str, val: &str) -> Result<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(PvLinkError::ConfigurationError(format!("Invalid {} value: {}", key, other))),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, val: &str) -> Result<T> {
    val.trim()
        .parse()
        .map_err(|_| PvLinkError::ConfigurationError(format!("Invalid {} value: {}", key, val)))
}
