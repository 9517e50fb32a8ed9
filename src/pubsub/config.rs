//! Configuration for the PubSub client

use rand::Rng;
use std::time::Duration;

/// Twitch PubSub endpoint
pub const PUBSUB_URL: &str = "wss://pubsub-edge.twitch.tv";

/// Configuration for automatic reconnection
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Whether to automatically reconnect on disconnect
    pub enabled: bool,
    /// Initial delay before first reconnect attempt
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Fraction of the delay randomized in either direction (0.0 - 1.0)
    pub jitter: f64,
    /// Maximum number of reconnect attempts (None for unlimited)
    pub max_attempts: Option<u32>,
    /// A connection that stays up this long resets the attempt counter
    pub stable_after: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.2,
            max_attempts: None,
            stable_after: Duration::from_secs(60),
        }
    }
}

impl ReconnectConfig {
    /// Create a new reconnect config with reconnection disabled
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed), without jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return std::cmp::min(self.initial_delay, self.max_delay);
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let multiplier = self.backoff_multiplier.powi(exponent);
        let delay_ms = self.initial_delay.as_millis() as f64 * multiplier;
        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }

        Duration::from_millis(delay_ms as u64)
    }

    /// Delay for a given attempt with jitter applied, still capped at `max_delay`
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }

        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        std::cmp::min(base.mul_f64(factor), self.max_delay)
    }

    /// Check if another reconnect attempt should be made
    pub fn should_attempt(&self, attempt: u32) -> bool {
        if !self.enabled {
            return false;
        }
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }
}

/// Configuration for [`PubSubClient`](super::PubSubClient)
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    /// WebSocket endpoint
    pub url: String,
    /// Interval between keepalive pings; must stay under the server's idle window
    pub keepalive_interval: Duration,
    /// How long to wait for a PONG before treating the connection as dead
    pub pong_timeout: Duration,
    /// Delay before honouring a server RECONNECT directive
    pub reconnect_grace: Duration,
    /// How long `disconnect` waits for the close handshake
    pub close_timeout: Duration,
    /// Pending requests older than this are rejected as expired
    pub pending_ttl: Duration,
    /// Reconnection policy
    pub reconnect: ReconnectConfig,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            url: PUBSUB_URL.to_string(),
            keepalive_interval: Duration::from_secs(4 * 60),
            pong_timeout: Duration::from_secs(10),
            reconnect_grace: Duration::from_secs(30),
            close_timeout: Duration::from_secs(5),
            pending_ttl: Duration::from_secs(60),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl PubSubConfig {
    /// Default config against a custom endpoint
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the keepalive interval and pong timeout
    pub fn keepalive(mut self, interval: Duration, pong_timeout: Duration) -> Self {
        self.keepalive_interval = interval;
        self.pong_timeout = pong_timeout;
        self
    }

    /// Set the RECONNECT grace delay
    pub fn reconnect_grace(mut self, grace: Duration) -> Self {
        self.reconnect_grace = grace;
        self
    }

    /// Set the pending request time-to-live
    pub fn pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = ttl;
        self
    }

    /// Set the reconnection policy
    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}
