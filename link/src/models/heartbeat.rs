use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Payload of the heartbeat endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Whether the backend's monitor process reports itself alive.
    pub alive: bool,

    /// Unix timestamp of the last heartbeat written by the monitor.
    #[serde(default)]
    pub timestamp: Option<f64>,

    /// Seconds since that heartbeat, as computed by the backend.
    #[serde(default)]
    pub age_seconds: Option<f64>,
}

/// Liveness of the upstream value-producing process as seen by the client.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HeartbeatState {
    pub alive: bool,
    pub age_seconds: Option<f64>,
    /// When the last poll (successful or not) completed.
    pub last_checked: Option<SystemTime>,
}

impl HeartbeatState {
    /// State after a successful poll.
    pub fn from_payload(payload: &HeartbeatPayload, checked_at: SystemTime) -> Self {
        Self {
            alive: payload.alive,
            age_seconds: payload.age_seconds,
            last_checked: Some(checked_at),
        }
    }

    /// State after a failed poll: always dead, age unknown.
    pub fn failed(checked_at: SystemTime) -> Self {
        Self {
            alive: false,
            age_seconds: None,
            last_checked: Some(checked_at),
        }
    }

    /// Returns true until the first poll has completed.
    pub fn is_unknown(&self) -> bool {
        self.last_checked.is_none()
    }
}
