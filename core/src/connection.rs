//! Connection state notifications.
//!
//! External observers (health checks, dashboards) subscribe to
//! [`ConnectionStateChanged`] notifications instead of polling the broker.

use crate::broker::BrokerError;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

/// Broker connection state as seen by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No usable connection.
    Disconnected,
    /// Connected and usable.
    Connected,
    /// A reconnect is in progress.
    Reconnecting,
}

impl ConnectionState {
    /// Whether this state is [`ConnectionState::Connected`].
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// A connection state transition.
#[derive(Debug, Clone)]
pub struct ConnectionStateChanged {
    /// The new state.
    pub state: ConnectionState,
    /// Human-readable reason, when known.
    pub reason: Option<String>,
    /// The error that caused the transition, when there was one.
    pub cause: Option<Arc<BrokerError>>,
    /// When the transition was observed.
    pub at: DateTime<Utc>,
}

impl ConnectionStateChanged {
    /// A transition to [`ConnectionState::Connected`].
    #[must_use]
    pub fn connected() -> Self {
        Self {
            state: ConnectionState::Connected,
            reason: None,
            cause: None,
            at: Utc::now(),
        }
    }

    /// A transition to [`ConnectionState::Disconnected`].
    #[must_use]
    pub fn disconnected(reason: impl Into<String>, cause: Option<BrokerError>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reason: Some(reason.into()),
            cause: cause.map(Arc::new),
            at: Utc::now(),
        }
    }

    /// A transition to [`ConnectionState::Reconnecting`].
    #[must_use]
    pub fn reconnecting(reason: impl Into<String>) -> Self {
        Self {
            state: ConnectionState::Reconnecting,
            reason: Some(reason.into()),
            cause: None,
            at: Utc::now(),
        }
    }

    /// Whether the new state is connected.
    #[must_use]
    pub const fn connected_flag(&self) -> bool {
        self.state.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnected_carries_reason_and_cause() {
        let change = ConnectionStateChanged::disconnected(
            "socket reset",
            Some(BrokerError::ConnectionClosed("reset by peer".into())),
        );
        assert!(!change.connected_flag());
        assert_eq!(change.reason.as_deref(), Some("socket reset"));
        assert!(change.cause.is_some());
    }

    #[test]
    fn state_display() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert!(ConnectionStateChanged::connected().connected_flag());
    }
}
