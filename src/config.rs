use std::time::Duration;

use crate::error::{CoordinationError, Result};

/// Connection settings for the shared relational store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// SQLite URL, e.g. `sqlite://cluster.db` or `sqlite::memory:`
    pub database_url: String,
    /// Connections kept in the pool shared by all background tasks
    pub max_connections: u32,
    /// How long a statement waits on a locked database before failing
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://cluster-coord.db".to_string(),
            max_connections: 5,
            busy_timeout_ms: 5000,
        }
    }
}

/// Timing and identity for one node taking part in one group.
///
/// All nodes sharing a group should use the same failure threshold, otherwise
/// they disagree on when a peer is dead.
#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    pub node_id: String,
    pub group_id: String,
    pub heartbeat_interval_ms: u64,
    /// Heartbeat age after which a node is declared dead
    pub failure_threshold_ms: u64,
    pub election_interval_ms: u64,
    pub listener_poll_interval_ms: u64,
    /// Consecutive heartbeat failures a coordinator tolerates before stepping down
    pub max_heartbeat_failures: u32,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            node_id: "node1".to_string(),
            group_id: "default".to_string(),
            heartbeat_interval_ms: 1000,
            failure_threshold_ms: 4000,
            election_interval_ms: 2000,
            listener_poll_interval_ms: 1000,
            max_heartbeat_failures: 3,
        }
    }
}

impl CoordinationConfig {
    pub fn new(node_id: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            group_id: group_id.into(),
            ..Default::default()
        }
    }

    pub fn with_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    pub fn with_failure_threshold_ms(mut self, ms: u64) -> Self {
        self.failure_threshold_ms = ms;
        self
    }

    pub fn with_election_interval_ms(mut self, ms: u64) -> Self {
        self.election_interval_ms = ms;
        self
    }

    pub fn with_listener_poll_interval_ms(mut self, ms: u64) -> Self {
        self.listener_poll_interval_ms = ms;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn failure_threshold(&self) -> Duration {
        Duration::from_millis(self.failure_threshold_ms)
    }

    pub fn election_interval(&self) -> Duration {
        Duration::from_millis(self.election_interval_ms)
    }

    pub fn listener_poll_interval(&self) -> Duration {
        Duration::from_millis(self.listener_poll_interval_ms)
    }

    /// Reject settings that would make a healthy node look dead under normal jitter.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(CoordinationError::InvalidConfig(
                "node_id must not be empty".to_string(),
            ));
        }
        if self.group_id.trim().is_empty() {
            return Err(CoordinationError::InvalidConfig(
                "group_id must not be empty".to_string(),
            ));
        }
        if self.heartbeat_interval_ms == 0
            || self.election_interval_ms == 0
            || self.listener_poll_interval_ms == 0
        {
            return Err(CoordinationError::InvalidConfig(
                "intervals must be greater than zero".to_string(),
            ));
        }
        if self.failure_threshold_ms <= 2 * self.heartbeat_interval_ms {
            return Err(CoordinationError::InvalidConfig(format!(
                "failure threshold ({}ms) must exceed twice the heartbeat interval ({}ms)",
                self.failure_threshold_ms, self.heartbeat_interval_ms
            )));
        }
        if self.max_heartbeat_failures == 0 {
            return Err(CoordinationError::InvalidConfig(
                "max_heartbeat_failures must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
