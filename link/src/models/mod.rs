//! Data models for pv-link.
//!
//! Defines the live-feed wire messages, PV samples, REST envelopes and
//! connection options.

pub mod api_response;
pub mod channel_state;
pub mod client_message;
pub mod connection_options;
pub mod feed_event;
pub mod heartbeat;
pub mod pv_value;
pub mod server_message;
pub mod severity;

#[cfg(test)]
mod tests;

pub use api_response::ApiResponse;
pub use channel_state::ChannelState;
pub use client_message::ClientMessage;
pub use connection_options::ConnectionOptions;
pub use feed_event::{FeedEvent, UpdateKind};
pub use heartbeat::{HeartbeatPayload, HeartbeatState};
pub use pv_value::PvValue;
pub use server_message::ServerMessage;
pub use severity::Severity;
