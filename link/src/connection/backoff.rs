//! Reconnect bookkeeping for the live channel.

use std::time::Duration;

use crate::models::ConnectionOptions;

/// What the channel should do after losing (or failing to open) a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Try again after `delay`; `attempt` is 1-based.
    Retry { attempt: u32, delay: Duration },
    /// Reconnection was suppressed by an explicit disconnect or is disabled.
    Suppressed,
    /// The configured maximum number of attempts has been used up.
    GiveUp { attempts: u32 },
}

/// Exponential backoff with a ceiling: `base * 2^attempts`, capped at `max`.
///
/// The attempt counter grows on every failed or closed cycle and resets to
/// zero once a connection opens.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    max: Duration,
    max_attempts: Option<u32>,
    auto_reconnect: bool,
    attempts: u32,
    suppressed: bool,
}

impl ReconnectPolicy {
    pub fn new(options: &ConnectionOptions) -> Self {
        Self {
            base: Duration::from_millis(options.reconnect_delay_ms),
            max: Duration::from_millis(options.max_reconnect_delay_ms),
            max_attempts: options.max_reconnect_attempts,
            auto_reconnect: options.auto_reconnect,
            attempts: 0,
            suppressed: false,
        }
    }

    /// Delay for a given attempt index without touching the counter.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Record a failed or closed cycle and decide what happens next.
    pub fn next(&mut self) -> ReconnectDecision {
        if self.suppressed || !self.auto_reconnect {
            return ReconnectDecision::Suppressed;
        }
        if let Some(max) = self.max_attempts {
            if self.attempts >= max {
                return ReconnectDecision::GiveUp {
                    attempts: self.attempts,
                };
            }
        }
        let delay = self.delay_for(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay,
        }
    }

    /// A connection opened: start over from the base delay.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Explicit disconnect: no further automatic reconnection.
    pub fn suppress(&mut self) {
        self.suppressed = true;
        if let Some(max) = self.max_attempts {
            self.attempts = max;
        }
    }

    /// Explicit connect: clear suppression and any exhausted attempt budget.
    pub fn rearm(&mut self) {
        self.suppressed = false;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }
}
