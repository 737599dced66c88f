//! Public types for the connection manager.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Connection state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket, and none being opened.
    Disconnected,
    /// Initial WebSocket handshake in progress.
    Connecting,
    /// Socket open.
    Connected,
    /// Connection lost, waiting for or performing reopen attempt `attempt`.
    Reconnecting { attempt: u32 },
    /// Reconnect attempts exhausted. Only an explicit `connect` leaves this state.
    GivenUp,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Automatic reconnection with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconnectPolicy {
    /// Reopen attempts per disconnect episode. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Delay before the first attempt.
    #[serde(with = "crate::config::millis")]
    pub initial_delay: Duration,
    /// Backoff cap.
    #[serde(with = "crate::config::millis")]
    pub max_delay: Duration,
    /// Re-issue the remembered subscribe and user-subscribe calls after a
    /// successful reconnect.
    pub resume_subscriptions: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            resume_subscriptions: false,
        }
    }
}

impl ReconnectPolicy {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn resume_subscriptions(mut self, resume: bool) -> Self {
        self.resume_subscriptions = resume;
        self
    }

    /// Delay before the given attempt (1-based): the initial delay doubled
    /// once per earlier failed attempt, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
