//! Timing and batching knobs for a node.

use std::time::Duration;

use anyhow::{Result, ensure};

/// Runtime configuration shared by every loop of a node.
///
/// The election timeout is a base value: each wait is drawn uniformly from
/// `[election_timeout, 2 * election_timeout)` so nodes rarely time out together.
#[derive(Debug, Clone)]
pub struct Config {
    pub election_timeout: Duration,
    /// Interval at which a leader contacts idle followers.
    pub heartbeat_interval: Duration,
    /// Upper bound for a single outbound RPC.
    pub rpc_timeout: Duration,
    /// Maximum number of entries in one append-entries request.
    pub max_append_entries: usize,
    /// Capacity of the inbound RPC and proposal queues.
    pub channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            rpc_timeout: Duration::from_millis(200),
            max_append_entries: 64,
            channel_capacity: 256,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.election_timeout.is_zero(),
            "election timeout must be positive"
        );
        ensure!(
            self.heartbeat_interval < self.election_timeout,
            "heartbeat interval ({:?}) must be shorter than the election timeout ({:?})",
            self.heartbeat_interval,
            self.election_timeout
        );
        ensure!(
            self.max_append_entries > 0,
            "max_append_entries must be at least 1"
        );
        ensure!(self.channel_capacity > 0, "channel capacity must be at least 1");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn heartbeat_must_be_shorter_than_election_timeout() {
        let config = Config {
            heartbeat_interval: Duration::from_millis(300),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_sized_batches_and_queues_are_rejected() {
        let config = Config {
            max_append_entries: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            channel_capacity: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
