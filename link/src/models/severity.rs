use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// Alarm severity of a PV sample.
///
/// Anything the feed does not state explicitly (missing field, `null`,
/// unrecognised text or number) is treated as [`Severity::Invalid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    NoAlarm,
    Minor,
    Major,
    #[default]
    Invalid,
}

impl Severity {
    /// Map an EPICS numeric severity (0..=3) onto the enum.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Severity::NoAlarm,
            1 => Severity::Minor,
            2 => Severity::Major,
            _ => Severity::Invalid,
        }
    }

    /// Parse the textual form used by the backend (`NO_ALARM`, `MINOR`, ...).
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_uppercase().as_str() {
            "NO_ALARM" | "NONE" | "OK" => Severity::NoAlarm,
            "MINOR" => Severity::Minor,
            "MAJOR" => Severity::Major,
            _ => Severity::Invalid,
        }
    }

    /// Whether the sample is in an alarm state of any level.
    pub fn is_alarm(&self) -> bool {
        !matches!(self, Severity::NoAlarm)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::NoAlarm => "NO_ALARM",
            Severity::Minor => "MINOR",
            Severity::Major => "MAJOR",
            Severity::Invalid => "INVALID",
        };
        f.write_str(label)
    }
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<JsonValue>::deserialize(deserializer)?;
        Ok(match raw {
            Some(JsonValue::Number(code)) => {
                code.as_i64().map(Severity::from_code).unwrap_or(Severity::Invalid)
            },
            Some(JsonValue::String(label)) => Severity::from_label(&label),
            _ => Severity::Invalid,
        })
    }
}
