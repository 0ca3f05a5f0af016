//! # pv-link
//!
//! Live process-variable (PV) values for EPICS configuration front-ends.
//!
//! pv-link keeps potentially tens of thousands of PV values current without
//! flooding the presentation layer:
//!
//! - **Live channel**: one WebSocket to the backend feed with explicit
//!   state machine, exponential-backoff reconnects and re-subscription on
//!   every open
//! - **Subscription registry**: reference-counted interest per PV name,
//!   shared by any number of consumers
//! - **Update buffer**: last-write-wins staging drained into an immutable
//!   snapshot on a fixed interval
//! - **Heartbeat monitor**: independent liveness polling of the process that
//!   produces the values, failing safe to "dead"
//! - **Tolerance/staleness**: pure evaluation of saved vs live values
//!
//! ## Example
//!
//! ```rust,no_run
//! use pv_link::{PvLinkClient, Tolerance};
//! use serde_json::json;
//!
//! # async fn example() -> pv_link::Result<()> {
//! let client = PvLinkClient::builder()
//!     .base_url("http://localhost:8080")
//!     .build()?;
//! client.start()?;
//!
//! let mut table = client.consumer(|name, value| {
//!     println!("{} -> {}", name, value.value);
//! });
//! table.set_pv_names(["LN:MAG1:I", "LN:MAG2:I"]);
//!
//! let state = client.evaluate("LN:MAG1:I", &json!(12.5), Tolerance::absolute(0.01));
//! println!("{:?}", state);
//!
//! client.dispose();
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod event_handlers;
pub mod heartbeat;
pub mod models;
pub mod query;
pub mod subscription;
pub mod timeouts;
pub mod tolerance;

pub use buffer::{FlushStats, FlushedBatch, LiveSnapshot, UpdateBuffer};
pub use client::{PvLinkClient, PvLinkClientBuilder};
pub use config::LinkConfig;
pub use connection::{ReconnectDecision, ReconnectPolicy, TransportChannel};
pub use error::{PvLinkError, Result};
pub use event_handlers::{ConnectionError, DisconnectReason, EventHandlers, NORMAL_CLOSURE};
pub use heartbeat::{HeartbeatListener, HeartbeatMonitor};
pub use models::{
    ChannelState, ConnectionOptions, FeedEvent, HeartbeatState, PvValue, Severity, UpdateKind,
};
pub use query::LiveValuesFetcher;
pub use subscription::{
    ConsumerSubscription, PvCallback, SubscriptionHandle, SubscriptionRegistry, SubscriptionSink,
};
pub use timeouts::{PvLinkTimeouts, PvLinkTimeoutsBuilder};
pub use tolerance::{evaluate_pv, is_stale, is_stale_at, within_tolerance, PvDisplayState, Tolerance};
