//! Shared data structures published to snapshot consumers.

use chrono::{DateTime, Local, Utc};

/// Status shown while a connection attempt is pending.
pub const STATUS_CONNECTING: &str = "Connecting...";
/// Terminal status once the retry budget is spent.
pub const STATUS_EXHAUSTED: &str = "Unable to connect. Please refresh.";
/// Label shown next to a price while the feed is open.
pub const STATUS_LIVE: &str = "Live";

/// Lifecycle of the single streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closed,
    Failed,
}

impl ConnectionState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

/// One decoded price tick. Always holds a finite, strictly positive price.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuoteObservation {
    price: f64,
    observed_at: DateTime<Utc>,
}

impl QuoteObservation {
    /// Returns `None` unless `price` is finite and greater than zero.
    pub fn new(price: f64, observed_at: DateTime<Utc>) -> Option<Self> {
        (price.is_finite() && price > 0.0).then_some(Self { price, observed_at })
    }

    pub fn price(&self) -> f64 {
        self.price
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    /// Observation instant rendered in the host's local time zone.
    pub fn local_display(&self) -> String {
        self.observed_at
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }
}

/// Full replacement state handed to the consumer after every state-affecting event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClientSnapshot {
    pub last_observation: Option<QuoteObservation>,
    pub connection_state: ConnectionState,
    pub status_message: Option<String>,
}

impl ClientSnapshot {
    pub fn is_live(&self) -> bool {
        self.connection_state == ConnectionState::Open
    }

    /// Text to show beside the price: "Live", "Connecting..." or the terminal failure.
    pub fn status_label(&self) -> &str {
        if self.is_live() {
            return STATUS_LIVE;
        }
        match (self.connection_state, self.status_message.as_deref()) {
            (ConnectionState::Failed, Some(msg)) => msg,
            (ConnectionState::Failed, None) => STATUS_EXHAUSTED,
            (_, Some(msg)) => msg,
            (_, None) => STATUS_CONNECTING,
        }
    }
}
