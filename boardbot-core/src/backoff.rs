// ABOUTME: Reconnect delay schedule for the event-stream session.
// ABOUTME: Doubles from the initial delay up to a ceiling and retries forever; a live connection starts it over.

use std::time::Duration;

/// Delay schedule for reconnecting to the event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    /// Ceiling for any single wait
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2,
        }
    }
}

/// Where the session is in its reconnect schedule.
///
/// There is no attempt limit: transient failures are retried until the
/// session is stopped or the stream refuses the bot token.
#[derive(Debug)]
pub struct ReconnectBackoff {
    config: BackoffConfig,
    attempts: u32,
    upcoming: Duration,
}

impl ReconnectBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        let upcoming = config.initial_delay;
        Self {
            config,
            attempts: 0,
            upcoming,
        }
    }

    /// The handshake went out on a fresh socket; the next outage starts from the initial delay
    pub fn reset_on_connect(&mut self) {
        self.attempts = 0;
        self.upcoming = self.config.initial_delay;
    }

    /// Wait to apply before the next connection attempt
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        let delay = self.upcoming;
        self.upcoming = self
            .upcoming
            .saturating_mul(self.config.multiplier)
            .min(self.config.max_delay);
        delay
    }

    /// Reconnect attempts since the last live connection
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

// =============================================================================
// Tests
// =============================================================================
