//! Live-feed connection management.
//!
//! This module contains:
//! - [`websocket`]: low-level helpers (URL resolution, dialing, frame codec)
//! - [`backoff`]: reconnect attempt bookkeeping and exponential delays
//! - [`channel`]: the long-lived [`TransportChannel`] and its background task

pub mod backoff;
pub mod channel;
pub(crate) mod websocket;

use std::time::Duration;

pub use backoff::{ReconnectDecision, ReconnectPolicy};
pub use channel::{FeedBatch, TransportChannel};

/// Default capacity of the channel that carries decoded value batches.
pub(crate) const DEFAULT_UPDATE_CHANNEL_CAPACITY: usize = 1024;

/// Maximum text message size (64 MiB).
pub(crate) const MAX_WS_TEXT_MESSAGE_BYTES: usize = 64 << 20;

/// Stand-in deadline for timers that are currently inactive.
pub(crate) const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);
