//! Timeout configuration for pv-link operations.
//!
//! Centralizes the timeouts used by the live channel (connect, send,
//! keepalive) and by the HTTP paths (heartbeat checks, live-value fetches).

use std::time::Duration;

/// Timeout configuration for pv-link operations.
///
/// # Examples
///
/// ```rust
/// use pv_link::PvLinkTimeouts;
/// use std::time::Duration;
///
/// // Use defaults (recommended for most cases)
/// let timeouts = PvLinkTimeouts::default();
///
/// // Custom timeouts for a slow control-room network
/// let timeouts = PvLinkTimeouts::builder()
///     .connection_timeout(Duration::from_secs(30))
///     .request_timeout(Duration::from_secs(60))
///     .build();
///
/// // Aggressive timeouts for local development
/// let timeouts = PvLinkTimeouts::fast();
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvLinkTimeouts {
    /// Timeout for establishing the live-feed WebSocket (TCP + TLS + upgrade).
    /// Default: 10 seconds
    pub connection_timeout: Duration,

    /// Timeout for writing a frame to the live feed.
    /// Default: 10 seconds
    pub send_timeout: Duration,

    /// Timeout for REST requests (live-value fetches).
    /// Default: 30 seconds
    pub request_timeout: Duration,

    /// Timeout for a single heartbeat check. Kept short so a hung backend
    /// is reported dead before the next poll tick.
    /// Default: 2 seconds
    pub heartbeat_timeout: Duration,

    /// Keep-alive ping interval for the WebSocket.
    /// Set to 0 to disable keep-alive pings.
    /// Default: 15 seconds
    pub keepalive_interval: Duration,

    /// Maximum time to wait for any frame after sending a keep-alive Ping.
    /// Set to 0 to disable.
    /// Default: 5 seconds
    pub pong_timeout: Duration,
}

impl Default for PvLinkTimeouts {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(2),
            keepalive_interval: Duration::from_secs(15),
            pong_timeout: Duration::from_secs(5),
        }
    }
}

impl PvLinkTimeouts {
    /// Create a new builder for custom timeout configuration.
    pub fn builder() -> PvLinkTimeoutsBuilder {
        PvLinkTimeoutsBuilder::new()
    }

    /// Create timeouts optimized for a backend on localhost.
    pub fn fast() -> Self {
        Self {
            connection_timeout: Duration::from_secs(2),
            send_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(1),
            keepalive_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(3),
        }
    }

    /// Create timeouts for high-latency or unreliable networks.
    pub fn relaxed() -> Self {
        Self {
            connection_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(120),
            heartbeat_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
        }
    }

    /// Check if a duration represents "no timeout" (zero or very large).
    pub fn is_no_timeout(duration: Duration) -> bool {
        duration.is_zero() || duration > Duration::from_secs(86400 * 365) // > 1 year
    }
}

/// Builder for creating custom [`PvLinkTimeouts`] configurations.
#[derive(Debug, Clone)]
pub struct PvLinkTimeoutsBuilder {
    timeouts: PvLinkTimeouts,
}

impl PvLinkTimeoutsBuilder {
    fn new() -> Self {
        Self {
            timeouts: PvLinkTimeouts::default(),
        }
    }

    /// Set the WebSocket connection timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connection_timeout = timeout;
        self
    }

    /// Set the WebSocket connection timeout in seconds.
    pub fn connection_timeout_secs(self, secs: u64) -> Self {
        self.connection_timeout(Duration::from_secs(secs))
    }

    /// Set the send timeout.
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.send_timeout = timeout;
        self
    }

    /// Set the REST request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.request_timeout = timeout;
        self
    }

    /// Set the REST request timeout in seconds.
    pub fn request_timeout_secs(self, secs: u64) -> Self {
        self.request_timeout(Duration::from_secs(secs))
    }

    /// Set the heartbeat check timeout.
    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.heartbeat_timeout = timeout;
        self
    }

    /// Set the keepalive ping interval.
    /// Set to 0 to disable keepalive pings.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.timeouts.keepalive_interval = interval;
        self
    }

    /// Set the keepalive ping interval in seconds.
    pub fn keepalive_interval_secs(self, secs: u64) -> Self {
        self.keepalive_interval(Duration::from_secs(secs))
    }

    /// Set the pong timeout (max wait for any frame after a Ping).
    /// Set to 0 to disable pong timeout checking.
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.pong_timeout = timeout;
        self
    }

    /// Build the timeout configuration.
    pub fn build(self) -> PvLinkTimeouts {
        self.timeouts
    }
}
