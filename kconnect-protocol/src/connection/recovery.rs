//! Reconnection backoff

use std::time::Duration;

/// Default number of connection attempts before giving up
pub const MAX_CONNECT_ATTEMPTS: u32 = 5;

/// Delay after the first failed attempt
pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for the delay between attempts
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Reconnection strategy with exponential backoff
#[derive(Debug, Clone)]
pub struct ReconnectionStrategy {
    /// Failed attempts so far
    pub attempt: u32,
    /// Total attempts allowed
    pub max_attempts: u32,
    pub initial_delay: Duration,
    /// Delay before the next attempt
    pub current_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectionStrategy {
    fn default() -> Self {
        Self::new(MAX_CONNECT_ATTEMPTS, INITIAL_RECONNECT_DELAY, MAX_RECONNECT_DELAY)
    }
}

impl ReconnectionStrategy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempt: 0,
            max_attempts: max_attempts.max(1),
            initial_delay,
            current_delay: initial_delay,
            max_delay,
        }
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_delay = self.initial_delay;
    }

    /// Check if more attempts are available
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Record a failed attempt and get the delay before the next one
    ///
    /// Returns `None` once every attempt has been used.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if !self.has_attempts_remaining() {
            return None;
        }

        let delay = self.current_delay;
        self.current_delay = std::cmp::min(self.current_delay * 2, self.max_delay);
        Some(delay)
    }

    /// Get human-readable status
    pub fn status(&self) -> String {
        format!(
            "Attempt {}/{}, next delay: {:?}",
            self.attempt, self.max_attempts, self.current_delay
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut strategy =
            ReconnectionStrategy::new(5, Duration::from_secs(10), Duration::from_secs(30));

        assert_eq!(strategy.next_delay(), Some(Duration::from_secs(10)));
        assert_eq!(strategy.next_delay(), Some(Duration::from_secs(20)));
        assert_eq!(strategy.next_delay(), Some(Duration::from_secs(30)));
        assert_eq!(strategy.next_delay(), Some(Duration::from_secs(30)));
        // fifth failure ends it
        assert_eq!(strategy.next_delay(), None);
        assert!(!strategy.has_attempts_remaining());
    }

    #[test]
    fn test_default_schedule() {
        let mut strategy = ReconnectionStrategy::default();
        let delays: Vec<_> = std::iter::from_fn(|| strategy.next_delay()).collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8)
            ]
        );
        assert_eq!(strategy.attempt, MAX_CONNECT_ATTEMPTS);
    }

    #[test]
    fn test_reset() {
        let mut strategy = ReconnectionStrategy::default();
        strategy.next_delay();
        strategy.next_delay();
        strategy.reset();

        assert_eq!(strategy.attempt, 0);
        assert_eq!(strategy.current_delay, INITIAL_RECONNECT_DELAY);
    }
}
