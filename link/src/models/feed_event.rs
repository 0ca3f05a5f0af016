use super::pv_value::PvValue;
use super::server_message::{RawValues, ServerMessage};

/// Where a batch of values came from on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// Values sent right after subscribing.
    Initial,
    /// Incremental changes.
    Diff,
    /// Full refresh of every subscribed PV.
    Snapshot,
}

/// A decoded live-feed frame.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// A batch of `(pv_name, value)` pairs.
    Values {
        kind: UpdateKind,
        values: Vec<(String, PvValue)>,
    },
    /// Server keep-alive.
    Heartbeat,
    /// Protocol error reported by the server.
    Error { message: String },
    /// Frame of a kind this client ignores.
    Unknown,
}

impl FeedEvent {
    /// Returns true if this is an error event
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Number of PV values carried by this event.
    pub fn value_count(&self) -> usize {
        match self {
            Self::Values { values, .. } => values.len(),
            _ => 0,
        }
    }
}

impl From<ServerMessage> for FeedEvent {
    fn from(msg: ServerMessage) -> Self {
        let batch = |kind, data: RawValues| FeedEvent::Values {
            kind,
            values: PvValue::decode_batch(data.unwrap_or_default()),
        };
        match msg {
            ServerMessage::Initial { data } => batch(UpdateKind::Initial, data),
            ServerMessage::Diff { data } => batch(UpdateKind::Diff, data),
            ServerMessage::Snapshot { data } => batch(UpdateKind::Snapshot, data),
            ServerMessage::Heartbeat => FeedEvent::Heartbeat,
            ServerMessage::Error { message } => FeedEvent::Error {
                message: message.unwrap_or_default(),
            },
            ServerMessage::Unknown => FeedEvent::Unknown,
        }
    }
}
