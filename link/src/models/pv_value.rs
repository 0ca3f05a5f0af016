use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

use super::severity::Severity;

/// One live sample of a process variable as delivered by the backend feed.
///
/// Samples are immutable once received; a later sample for the same PV name
/// supersedes the earlier one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "WirePvValue")]
pub struct PvValue {
    /// Scalar, array or `null`.
    pub value: JsonValue,

    /// EPICS alarm status text (e.g. `"HIHI"`), if reported.
    pub status: Option<String>,

    pub severity: Severity,

    /// Whether the backend currently has a CA/PVA connection to the PV.
    /// Absent or `null` means not connected.
    pub connected: bool,

    /// Unix timestamp (seconds) of the sample.
    pub updated_at: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

/// A sample as the backend may send it. The timestamp shows up under three
/// names; `updatedAt` wins over `updated_at`, which wins over `timestamp`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePvValue {
    #[serde(default)]
    value: JsonValue,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    severity: Severity,
    #[serde(default)]
    connected: Option<bool>,
    #[serde(default)]
    updated_at: Option<f64>,
    #[serde(default, rename = "updated_at")]
    updated_at_snake: Option<f64>,
    #[serde(default)]
    timestamp: Option<f64>,
    #[serde(default)]
    units: Option<String>,
}

impl From<WirePvValue> for PvValue {
    fn from(wire: WirePvValue) -> Self {
        Self {
            value: wire.value,
            status: wire.status,
            severity: wire.severity,
            connected: wire.connected.unwrap_or(false),
            updated_at: wire.updated_at.or(wire.updated_at_snake).or(wire.timestamp),
            units: wire.units,
        }
    }
}

impl PvValue {
    /// Create a connected, alarm-free sample with the given value and timestamp.
    pub fn new(value: impl Into<JsonValue>, updated_at: f64) -> Self {
        Self {
            value: value.into(),
            status: None,
            severity: Severity::NoAlarm,
            connected: true,
            updated_at: Some(updated_at),
            units: None,
        }
    }

    /// A placeholder sample for a PV the backend reports as disconnected.
    pub fn disconnected() -> Self {
        Self {
            value: JsonValue::Null,
            status: None,
            severity: Severity::Invalid,
            connected: false,
            updated_at: None,
            units: None,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    /// Decode a `name -> sample` map entry by entry. Entries that are not a
    /// valid sample are logged and skipped; the rest are kept.
    pub fn decode_batch(data: HashMap<String, JsonValue>) -> Vec<(String, PvValue)> {
        let mut values = Vec::with_capacity(data.len());
        for (pv_name, raw) in data {
            match serde_json::from_value::<PvValue>(raw) {
                Ok(value) => values.push((pv_name, value)),
                Err(e) => log::warn!("[pv-link] Skipping malformed value for '{}': {}", pv_name, e),
            }
        }
        values
    }

    /// Returns the value as `f64` when it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        self.value.as_f64()
    }

    /// Returns `true` if the sample carries no value.
    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }
}
