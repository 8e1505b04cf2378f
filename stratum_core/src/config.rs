//! Configuration knobs for the sync and fan-out machinery.
//!
//! Everything has a sensible default; knobs can be set through the builder methods or read from
//! the environment (`STRATUM_*` variables).
use std::time::Duration;

use crate::{Error, Result};

/// Configuration for the change-log poller and entity reloads.
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Interval between change-log polls.
    ///
    /// Defaults to [`SyncConfig::DEFAULT_POLL_INTERVAL`].
    pub poll_interval: Duration,
    /// Jitter applies a randomized duration to subtract from the poll interval. This helps to
    /// avoid multiple instances synchronizing and producing spiky load on the change log.
    ///
    /// Defaults to [`SyncConfig::DEFAULT_POLL_JITTER`].
    pub poll_jitter: Duration,
    /// Maximum change-log rows fetched per poll.
    pub poll_batch: usize,
    /// Bound on a single entity reload from the authoritative store.
    pub reload_timeout: Duration,
    /// How many times a failing entity reload is retried before the change-log entry is
    /// deferred to the next poll.
    pub reload_retries: u32,
}

impl SyncConfig {
    /// Default value for [`SyncConfig::poll_interval`].
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
    /// Default value for [`SyncConfig::poll_jitter`].
    pub const DEFAULT_POLL_JITTER: Duration = Duration::from_millis(100);
    /// Default value for [`SyncConfig::poll_batch`].
    pub const DEFAULT_POLL_BATCH: usize = 1000;
    /// Default value for [`SyncConfig::reload_timeout`].
    pub const DEFAULT_RELOAD_TIMEOUT: Duration = Duration::from_secs(5);
    /// Default value for [`SyncConfig::reload_retries`].
    pub const DEFAULT_RELOAD_RETRIES: u32 = 3;

    /// Create a new `SyncConfig` using default configuration.
    pub fn new() -> SyncConfig {
        SyncConfig::default()
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> SyncConfig {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_poll_jitter(mut self, poll_jitter: Duration) -> SyncConfig {
        self.poll_jitter = poll_jitter;
        self
    }

    pub fn with_poll_batch(mut self, poll_batch: usize) -> SyncConfig {
        self.poll_batch = poll_batch;
        self
    }

    pub fn with_reload_timeout(mut self, reload_timeout: Duration) -> SyncConfig {
        self.reload_timeout = reload_timeout;
        self
    }

    pub fn with_reload_retries(mut self, reload_retries: u32) -> SyncConfig {
        self.reload_retries = reload_retries;
        self
    }

    /// Read overrides from `STRATUM_POLL_INTERVAL_MS`, `STRATUM_POLL_JITTER_MS`,
    /// `STRATUM_POLL_BATCH`, `STRATUM_RELOAD_TIMEOUT_MS` and `STRATUM_RELOAD_RETRIES`.
    pub fn from_env() -> Result<SyncConfig> {
        Ok(SyncConfig {
            poll_interval: duration_ms_var(
                "STRATUM_POLL_INTERVAL_MS",
                SyncConfig::DEFAULT_POLL_INTERVAL,
            )?,
            poll_jitter: duration_ms_var(
                "STRATUM_POLL_JITTER_MS",
                SyncConfig::DEFAULT_POLL_JITTER,
            )?,
            poll_batch: parse_var("STRATUM_POLL_BATCH", SyncConfig::DEFAULT_POLL_BATCH)?,
            reload_timeout: duration_ms_var(
                "STRATUM_RELOAD_TIMEOUT_MS",
                SyncConfig::DEFAULT_RELOAD_TIMEOUT,
            )?,
            reload_retries: parse_var(
                "STRATUM_RELOAD_RETRIES",
                SyncConfig::DEFAULT_RELOAD_RETRIES,
            )?,
        })
    }
}

impl Default for SyncConfig {
    fn default() -> SyncConfig {
        SyncConfig {
            poll_interval: SyncConfig::DEFAULT_POLL_INTERVAL,
            poll_jitter: SyncConfig::DEFAULT_POLL_JITTER,
            poll_batch: SyncConfig::DEFAULT_POLL_BATCH,
            reload_timeout: SyncConfig::DEFAULT_RELOAD_TIMEOUT,
            reload_retries: SyncConfig::DEFAULT_RELOAD_RETRIES,
        }
    }
}

/// Configuration for the subscriber fan-out.
#[derive(Debug, Clone, PartialEq)]
pub struct FanoutConfig {
    /// Maximum number of registered subscribers.
    pub max_subscribers: usize,
    /// Depth of each subscriber's event queue. A subscriber whose queue overflows is marked
    /// stale and must resync.
    pub queue_depth: usize,
}

impl FanoutConfig {
    /// Default value for [`FanoutConfig::max_subscribers`].
    pub const DEFAULT_MAX_SUBSCRIBERS: usize = 256;
    /// Default value for [`FanoutConfig::queue_depth`].
    pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

    /// Create a new `FanoutConfig` using default configuration.
    pub fn new() -> FanoutConfig {
        FanoutConfig::default()
    }

    pub fn with_max_subscribers(mut self, max_subscribers: usize) -> FanoutConfig {
        self.max_subscribers = max_subscribers;
        self
    }

    pub fn with_queue_depth(mut self, queue_depth: usize) -> FanoutConfig {
        self.queue_depth = queue_depth;
        self
    }

    /// Read overrides from `STRATUM_MAX_SUBSCRIBERS` and `STRATUM_SUBSCRIBER_QUEUE_DEPTH`.
    pub fn from_env() -> Result<FanoutConfig> {
        Ok(FanoutConfig {
            max_subscribers: parse_var(
                "STRATUM_MAX_SUBSCRIBERS",
                FanoutConfig::DEFAULT_MAX_SUBSCRIBERS,
            )?,
            queue_depth: parse_var(
                "STRATUM_SUBSCRIBER_QUEUE_DEPTH",
                FanoutConfig::DEFAULT_QUEUE_DEPTH,
            )?,
        })
    }
}

impl Default for FanoutConfig {
    fn default() -> FanoutConfig {
        FanoutConfig {
            max_subscribers: FanoutConfig::DEFAULT_MAX_SUBSCRIBERS,
            queue_depth: FanoutConfig::DEFAULT_QUEUE_DEPTH,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("{name}={raw} is not a valid value"))),
        Err(_) => Ok(default),
    }
}

fn duration_ms_var(name: &str, default: Duration) -> Result<Duration> {
    parse_var(name, default.as_millis() as u64).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let sync = SyncConfig::new();
        assert_eq!(sync.poll_interval, Duration::from_secs(1));
        assert_eq!(sync.poll_batch, 1000);

        let fanout = FanoutConfig::new();
        assert_eq!(fanout.max_subscribers, 256);
        assert_eq!(fanout.queue_depth, 1024);
    }

    #[test]
    fn builders_override_fields() {
        let sync = SyncConfig::new()
            .with_poll_interval(Duration::from_millis(50))
            .with_poll_batch(10)
            .with_reload_retries(1);
        assert_eq!(sync.poll_interval, Duration::from_millis(50));
        assert_eq!(sync.poll_batch, 10);
        assert_eq!(sync.reload_retries, 1);
    }
}
