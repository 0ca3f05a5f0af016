use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Per-PV entries of a value frame, kept raw so that one bad entry does not
/// sink the whole frame. `null` and a missing `data` both mean no entries.
pub type RawValues = Option<HashMap<String, JsonValue>>;

/// Messages sent by the server on the live feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Current values for newly subscribed PVs.
    #[serde(
        alias = "subscribe-ack",
        alias = "subscribe_ack",
        alias = "initial-values",
        alias = "initial_values"
    )]
    Initial {
        #[serde(default)]
        data: RawValues,
    },

    /// Values that changed since the last frame.
    #[serde(alias = "update")]
    Diff {
        #[serde(default)]
        data: RawValues,
    },

    /// Full set of values for every subscribed PV.
    Snapshot {
        #[serde(default)]
        data: RawValues,
    },

    /// Keep-alive from the server; carries no PV data.
    Heartbeat,

    /// Protocol-level error report. Non-fatal.
    Error {
        #[serde(default)]
        message: Option<String>,
    },

    /// Any `type` this client does not understand.
    #[serde(other)]
    Unknown,
}
