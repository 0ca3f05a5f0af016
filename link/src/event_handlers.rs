//! Connection lifecycle event handlers for the live channel.
//!
//! Callback hooks for monitoring the live-feed connection:
//!
//! - [`on_connect`](EventHandlers::on_connect): the WebSocket opened
//! - [`on_disconnect`](EventHandlers::on_disconnect): the WebSocket closed
//! - [`on_error`](EventHandlers::on_error): connection or protocol error
//! - [`on_reconnect_scheduled`](EventHandlers::on_reconnect_scheduled): a
//!   backoff delay was scheduled
//! - [`on_receive`](EventHandlers::on_receive) / [`on_send`](EventHandlers::on_send):
//!   raw frame debug hooks
//!
//! # Example
//!
//! ```rust
//! use pv_link::EventHandlers;
//!
//! let handlers = EventHandlers::new()
//!     .on_connect(|| println!("live feed connected"))
//!     .on_disconnect(|reason| println!("live feed lost: {}", reason))
//!     .on_error(|error| eprintln!("live feed error: {}", error));
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Close code the client sends when it ends the session itself.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Why the live feed went away, as handed to `on_disconnect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReason {
    pub message: String,
    /// Close code of the close frame; `None` when the socket dropped without one.
    pub code: Option<u16>,
}

impl DisconnectReason {
    /// The socket was lost without a close frame.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: u16) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
        }
    }

    /// Session ended by `disconnect`, `stop` or shutdown. No reconnect follows.
    pub(crate) fn client_closed(message: impl Into<String>) -> Self {
        Self::with_code(message, NORMAL_CLOSURE)
    }

    pub fn is_normal_closure(&self) -> bool {
        self.code == Some(NORMAL_CLOSURE)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} [close {}]", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

/// Live-feed problem reported through `on_error`.
///
/// Transient errors (failed dial, dropped socket, server `error` frame) leave
/// the reconnect policy running. A fatal one means the channel has stopped
/// retrying and stays down until the next `connect()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionError {
    pub message: String,
    pub recoverable: bool,
}

impl ConnectionError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: false,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.recoverable {
            f.write_str(&self.message)
        } else {
            write!(f, "{} (giving up)", self.message)
        }
    }
}

/// Called once the feed socket is open.
pub type OnConnectCallback = Arc<dyn Fn() + Send + Sync>;

pub type OnDisconnectCallback = Arc<dyn Fn(DisconnectReason) + Send + Sync>;

pub type OnErrorCallback = Arc<dyn Fn(ConnectionError) + Send + Sync>;

/// `(attempt, delay)` of the reconnect that was just scheduled.
pub type OnReconnectCallback = Arc<dyn Fn(u32, Duration) + Send + Sync>;

/// Raw JSON text of one frame, for debugging.
pub type OnFrameCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Connection lifecycle event handlers.
///
/// All handlers are optional. Handlers run on the channel's background task,
/// so they must be quick and must not block.
#[derive(Clone, Default)]
pub struct EventHandlers {
    pub(crate) on_connect: Option<OnConnectCallback>,
    pub(crate) on_disconnect: Option<OnDisconnectCallback>,
    pub(crate) on_error: Option<OnErrorCallback>,
    pub(crate) on_reconnect_scheduled: Option<OnReconnectCallback>,
    pub(crate) on_receive: Option<OnFrameCallback>,
    pub(crate) on_send: Option<OnFrameCallback>,
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_reconnect_scheduled", &self.on_reconnect_scheduled.is_some())
            .field("on_receive", &self.on_receive.is_some())
            .field("on_send", &self.on_send.is_some())
            .finish()
    }
}

impl EventHandlers {
    /// Create a new empty `EventHandlers` (no callbacks registered).
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked when the live feed connection opens.
    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked when the live feed connection closes.
    pub fn on_disconnect(mut self, f: impl Fn(DisconnectReason) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked when a connection or protocol error occurs.
    ///
    /// The [`ConnectionError`] says whether auto-reconnect may still help.
    pub fn on_error(mut self, f: impl Fn(ConnectionError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked each time a reconnect is scheduled, with
    /// the attempt number (1-based) and the backoff delay.
    ///
    /// ```rust
    /// use pv_link::EventHandlers;
    ///
    /// let handlers = EventHandlers::new()
    ///     .on_reconnect_scheduled(|attempt, delay| {
    ///         println!("reconnect #{} in {:?}", attempt, delay)
    ///     });
    /// ```
    pub fn on_reconnect_scheduled(
        mut self,
        f: impl Fn(u32, Duration) + Send + Sync + 'static,
    ) -> Self {
        self.on_reconnect_scheduled = Some(Arc::new(f));
        self
    }

    /// Register a debug hook receiving every raw inbound text frame.
    pub fn on_receive(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_receive = Some(Arc::new(f));
        self
    }

    /// Register a debug hook receiving every raw outbound text frame.
    pub fn on_send(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_send = Some(Arc::new(f));
        self
    }

    /// Returns `true` if any handler is registered.
    pub fn has_any(&self) -> bool {
        self.on_connect.is_some()
            || self.on_disconnect.is_some()
            || self.on_error.is_some()
            || self.on_reconnect_scheduled.is_some()
            || self.on_receive.is_some()
            || self.on_send.is_some()
    }

    // ---------------------------------------------------------------
    // Internal dispatch helpers
    // ---------------------------------------------------------------

    pub(crate) fn emit_connect(&self) {
        if let Some(cb) = &self.on_connect {
            cb();
        }
    }

    pub(crate) fn emit_disconnect(&self, reason: DisconnectReason) {
        if let Some(cb) = &self.on_disconnect {
            cb(reason);
        }
    }

    pub(crate) fn emit_error(&self, error: ConnectionError) {
        if let Some(cb) = &self.on_error {
            cb(error);
        }
    }

    pub(crate) fn emit_reconnect_scheduled(&self, attempt: u32, delay: Duration) {
        if let Some(cb) = &self.on_reconnect_scheduled {
            cb(attempt, delay);
        }
    }

    pub(crate) fn emit_receive(&self, raw: &str) {
        if let Some(cb) = &self.on_receive {
            cb(raw);
        }
    }

    pub(crate) fn emit_send(&self, raw: &str) {
        if let Some(cb) = &self.on_send {
            cb(raw);
        }
    }
}
