//! Polling configuration for the sync engine

use std::time::Duration;

/// Maximum records a single fetch may request from the platform.
pub const FETCH_MAX: usize = 100;

/// Tuning knobs for the polling loop.
///
/// The defaults match the reference deployment: one-second ticks, no delay
/// between consecutive probe fetches within a tick, and full-history fetches
/// capped at the platform maximum.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Delay between ticks of the live poll loop
    pub poll_interval: Duration,
    /// Delay between consecutive probe fetches within one tick
    pub fetch_delay: Duration,
    /// Record count requested by full-history fetches
    pub fetch_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            fetch_delay: Duration::ZERO,
            fetch_limit: FETCH_MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.fetch_delay, Duration::ZERO);
        assert_eq!(config.fetch_limit, 100);
    }
}
