//! Tolerance and staleness evaluation.
//!
//! Pure functions: no I/O, no clocks except in [`is_stale`], which reads the
//! system clock and delegates to [`is_stale_at`].

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::models::{HeartbeatState, PvValue};

/// Compare a saved value against a live one.
///
/// - both null: `true` (nothing to compare)
/// - exactly one null: `false`
/// - two strings: exact equality, tolerances ignored
/// - two numbers: equal, or `|saved - live| <= abs_tol` when `abs_tol > 0`,
///   or `|saved - live| / |saved| <= rel_tol` when `rel_tol > 0` and
///   `saved != 0`; with both tolerances unset only exact equality passes
/// - anything else: strict equality
pub fn within_tolerance(saved: &JsonValue, live: &JsonValue, abs_tol: f64, rel_tol: f64) -> bool {
    match (saved, live) {
        (JsonValue::Null, JsonValue::Null) => true,
        (JsonValue::Null, _) | (_, JsonValue::Null) => false,
        (JsonValue::String(a), JsonValue::String(b)) => a == b,
        (JsonValue::Number(a), JsonValue::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => numbers_within(a, b, abs_tol, rel_tol),
            _ => a == b,
        },
        _ => saved == live,
    }
}

fn numbers_within(saved: f64, live: f64, abs_tol: f64, rel_tol: f64) -> bool {
    if saved == live {
        return true;
    }
    let diff = (saved - live).abs();
    if abs_tol > 0.0 && diff <= abs_tol {
        return true;
    }
    if rel_tol > 0.0 && saved != 0.0 && diff / saved.abs() <= rel_tol {
        return true;
    }
    false
}

/// `true` when the sample is older than `threshold_secs` right now.
/// A missing timestamp is never stale.
pub fn is_stale(updated_at: Option<f64>, threshold_secs: f64) -> bool {
    is_stale_at(updated_at, threshold_secs, unix_now())
}

/// [`is_stale`] against an explicit `now` (unix seconds).
pub fn is_stale_at(updated_at: Option<f64>, threshold_secs: f64, now: f64) -> bool {
    match updated_at {
        Some(updated_at) => now - updated_at > threshold_secs,
        None => false,
    }
}

/// Current time in unix seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Absolute and relative tolerance for one PV. Zero means unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    #[serde(default)]
    pub absolute: f64,
    #[serde(default)]
    pub relative: f64,
}

impl Tolerance {
    pub const EXACT: Tolerance = Tolerance {
        absolute: 0.0,
        relative: 0.0,
    };

    pub fn absolute(absolute: f64) -> Self {
        Self {
            absolute,
            relative: 0.0,
        }
    }

    pub fn relative(relative: f64) -> Self {
        Self {
            absolute: 0.0,
            relative,
        }
    }

    pub fn accepts(&self, saved: &JsonValue, live: &JsonValue) -> bool {
        within_tolerance(saved, live, self.absolute, self.relative)
    }
}

/// What a PV row should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PvDisplayState {
    /// No live sample has arrived yet.
    NeverReceived,
    /// The backend reports the PV itself as disconnected.
    Disconnected,
    /// Last sample is too old, or the value-producing process is dead.
    Stale,
    /// Live value is outside tolerance of the saved value.
    Differs,
    /// Live value matches the saved value within tolerance.
    Matches,
}

impl PvDisplayState {
    /// Whether the live value can be trusted for comparison.
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Differs | Self::Matches)
    }
}

/// Derive the display state of one PV at time `now`.
///
/// Precedence: never received, disconnected, stale, then the tolerance
/// comparison. A dead heartbeat makes every received sample stale, since
/// nothing is refreshing them.
pub fn evaluate_pv(
    saved: &JsonValue,
    live: Option<&PvValue>,
    tolerance: Tolerance,
    heartbeat: &HeartbeatState,
    stale_threshold_secs: f64,
    now: f64,
) -> PvDisplayState {
    let Some(live) = live else {
        return PvDisplayState::NeverReceived;
    };
    if !live.connected {
        return PvDisplayState::Disconnected;
    }
    if !heartbeat.alive || is_stale_at(live.updated_at, stale_threshold_secs, now) {
        return PvDisplayState::Stale;
    }
    if tolerance.accepts(saved, &live.value) {
        PvDisplayState::Matches
    } else {
        PvDisplayState::Differs
    }
}
