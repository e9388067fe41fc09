//! Engine configuration.

use std::time::Duration;

/// Identity the client presents when authenticating with the relay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Viewer {
    /// Random synthetic uid, no cookie.
    #[default]
    Anonymous,
    /// A logged-in account. The cookie is sent to discovery and its
    /// `buvid3` (if any) becomes the device id.
    Authenticated { uid: u64, cookie: String },
}

impl Viewer {
    pub fn authenticated(uid: u64, cookie: impl Into<String>) -> Self {
        Self::Authenticated {
            uid,
            cookie: cookie.into(),
        }
    }

    pub fn cookie(&self) -> Option<&str> {
        match self {
            Self::Anonymous => None,
            Self::Authenticated { cookie, .. } => Some(cookie.as_str()),
        }
    }
}

/// Bounded reconnect policy for a room session.
///
/// Every failure bumps the consecutive failure counter before it is compared
/// against `max_consecutive_failures`; the first frame read successfully
/// resets it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Consecutive failures after which the room is torn down.
    pub max_consecutive_failures: u32,
    /// Dial attempts per endpoint before moving to the next one.
    pub dial_attempts: u32,
    /// Pause between dial attempts on the same endpoint.
    pub dial_retry_delay: Duration,
    /// Timeout for a single dial.
    pub connect_timeout: Duration,
    /// Backoff after the first failure.
    pub initial_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 10,
            dial_attempts: 3,
            dial_retry_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Whether a session that has just hit its `failures`-th consecutive
    /// failure may try again.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_consecutive_failures
    }

    /// Delay before the next attempt after `failures` consecutive failures (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let delay_ms = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let max_ms = self.max_backoff.as_millis() as f64;
        Duration::from_millis(delay_ms.min(max_ms) as u64)
    }
}

/// Engine-wide settings. Build with [`crate::EngineBuilder`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Dispatcher worker count. Per-room ordering only holds with 1.
    pub workers: usize,
    /// Surface unknown and ignored commands through the raw handler.
    pub debug: bool,
    /// Suppress chat messages that duplicate an active storm broadcast.
    pub storm_filter: bool,
    /// Identity used by [`crate::Engine::join`].
    pub viewer: Viewer,
    pub heartbeat_interval: Duration,
    /// Capacity of the session → splitter queue.
    pub raw_queue_capacity: usize,
    /// Capacity of the splitter → dispatcher queue.
    pub frame_queue_capacity: usize,
    /// Largest frame the read loop accepts.
    pub max_frame_len: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            debug: false,
            storm_filter: false,
            viewer: Viewer::Anonymous,
            heartbeat_interval: Duration::from_secs(30),
            raw_queue_capacity: 1000,
            frame_queue_capacity: 300,
            max_frame_len: 16 * 1024 * 1024,
            reconnect: ReconnectPolicy::default(),
        }
    }
}
