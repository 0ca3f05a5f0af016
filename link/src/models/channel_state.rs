use std::fmt;

/// Lifecycle state of the live channel.
///
/// Transitions:
/// `Disconnected → Connecting → Open → Closing → Disconnected`, with
/// `Open → Disconnected` on an unexpected drop and
/// `Disconnected → Connecting` when a scheduled reconnect fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelState {
    #[default]
    Disconnected,
    Connecting,
    Open,
    Closing,
}

impl ChannelState {
    pub fn is_open(&self) -> bool {
        matches!(self, ChannelState::Open)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Open)
                | (Connecting, Disconnected)
                | (Open, Closing)
                | (Open, Disconnected)
                | (Closing, Disconnected)
        )
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Disconnected => write!(f, "disconnected"),
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Open => write!(f, "open"),
            ChannelState::Closing => write!(f, "closing"),
        }
    }
}
