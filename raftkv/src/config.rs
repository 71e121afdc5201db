//! Raft runtime configuration.

use std::path::PathBuf;

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

/// Default minimum election timeout, in milliseconds.
pub const DEFAULT_MIN_ELECTION_TIMEOUT: u64 = 300;
/// Default maximum election timeout, in milliseconds.
pub const DEFAULT_MAX_ELECTION_TIMEOUT: u64 = 600;
/// Default heartbeat timeout, in milliseconds.
pub const DEFAULT_HEARTBEAT_TIMEOUT: u64 = 75;
/// Default bound on transaction duration, in milliseconds.
///
/// Committed log entries are retained in memory at least this long so that
/// open transactions based on them can still be conflict-checked.
pub const DEFAULT_MAX_TRANSACTION_DURATION: u64 = 5_000;
/// Default bound on memory retained by unapplied log entries, in bytes.
pub const DEFAULT_MAX_APPLIED_LOG_MEMORY: u64 = 10 * 1024 * 1024;
/// Default commit timeout, in milliseconds.
pub const DEFAULT_COMMIT_TIMEOUT: u64 = 5_000;

/// The fraction by which two nodes' clocks are assumed to drift apart, used
/// to discount the leader lease.
pub const MAX_CLOCK_DRIFT: f64 = 0.01;

/// The runtime configuration of a Raft node.
///
/// Built via [`Config::build`]; [`ConfigBuilder::validate`] enforces the
/// timing invariant `heartbeat_timeout < min_election_timeout <=
/// max_election_timeout` and rejects an empty identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// This node's identity within the cluster.
    pub identity: String,
    /// The directory holding the persistent Raft log files.
    pub log_dir: PathBuf,
    /// The minimum election timeout, in milliseconds.
    pub min_election_timeout: u64,
    /// The maximum election timeout, in milliseconds.
    pub max_election_timeout: u64,
    /// The interval at which leaders send heartbeats, in milliseconds.
    pub heartbeat_timeout: u64,
    /// How long committed log entries are retained in memory for
    /// conflict-checking against open transactions, in milliseconds.
    pub max_transaction_duration: u64,
    /// The maximum memory retained by committed-but-unapplied log entries,
    /// in bytes. Exceeding it forces early application to the state machine.
    pub max_applied_log_memory: u64,
    /// The default timeout for transaction commits, in milliseconds.
    pub commit_timeout: u64,
    /// Whether a follower probes its peers for reachability before
    /// converting to candidate, to avoid pointless elections while
    /// partitioned.
    pub follower_probing_enabled: bool,
}

impl Config {
    /// Start the builder process for a node with the given identity.
    pub fn build(identity: String) -> ConfigBuilder {
        ConfigBuilder {
            identity,
            log_dir: None,
            min_election_timeout: None,
            max_election_timeout: None,
            heartbeat_timeout: None,
            max_transaction_duration: None,
            max_applied_log_memory: None,
            commit_timeout: None,
            follower_probing_enabled: None,
        }
    }

    /// Generate a new random election timeout within the configured range.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.min_election_timeout..=self.max_election_timeout)
    }
}

/// A builder for the [`Config`] type.
pub struct ConfigBuilder {
    identity: String,
    log_dir: Option<PathBuf>,
    min_election_timeout: Option<u64>,
    max_election_timeout: Option<u64>,
    heartbeat_timeout: Option<u64>,
    max_transaction_duration: Option<u64>,
    max_applied_log_memory: Option<u64>,
    commit_timeout: Option<u64>,
    follower_probing_enabled: Option<bool>,
}

impl ConfigBuilder {
    /// Set the directory holding the persistent Raft log.
    pub fn log_dir(mut self, dir: PathBuf) -> Self {
        self.log_dir = Some(dir);
        self
    }

    /// Set the minimum election timeout, in milliseconds.
    pub fn election_timeout_min(mut self, val: u64) -> Self {
        self.min_election_timeout = Some(val);
        self
    }

    /// Set the maximum election timeout, in milliseconds.
    pub fn election_timeout_max(mut self, val: u64) -> Self {
        self.max_election_timeout = Some(val);
        self
    }

    /// Set the heartbeat timeout, in milliseconds.
    pub fn heartbeat_timeout(mut self, val: u64) -> Self {
        self.heartbeat_timeout = Some(val);
        self
    }

    /// Set the maximum transaction duration, in milliseconds.
    pub fn max_transaction_duration(mut self, val: u64) -> Self {
        self.max_transaction_duration = Some(val);
        self
    }

    /// Set the unapplied-log memory bound, in bytes.
    pub fn max_applied_log_memory(mut self, val: u64) -> Self {
        self.max_applied_log_memory = Some(val);
        self
    }

    /// Set the default commit timeout, in milliseconds.
    pub fn commit_timeout(mut self, val: u64) -> Self {
        self.commit_timeout = Some(val);
        self
    }

    /// Enable or disable pre-election follower probing.
    pub fn follower_probing(mut self, enabled: bool) -> Self {
        self.follower_probing_enabled = Some(enabled);
        self
    }

    /// Validate the state of this builder, returning a config on success.
    pub fn validate(self) -> Result<Config, ConfigError> {
        if self.identity.is_empty() {
            return Err(ConfigError::MissingIdentity);
        }
        let log_dir = self.log_dir.ok_or(ConfigError::MissingLogDir)?;

        let min_election_timeout = self.min_election_timeout.unwrap_or(DEFAULT_MIN_ELECTION_TIMEOUT);
        let max_election_timeout = self.max_election_timeout.unwrap_or(DEFAULT_MAX_ELECTION_TIMEOUT);
        let heartbeat_timeout = self.heartbeat_timeout.unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT);

        if min_election_timeout > max_election_timeout {
            return Err(ConfigError::InvalidElectionTimeoutMinMax);
        }
        if heartbeat_timeout >= min_election_timeout {
            return Err(ConfigError::InvalidHeartbeatTimeout);
        }

        Ok(Config {
            identity: self.identity,
            log_dir,
            min_election_timeout,
            max_election_timeout,
            heartbeat_timeout,
            max_transaction_duration: self.max_transaction_duration.unwrap_or(DEFAULT_MAX_TRANSACTION_DURATION),
            max_applied_log_memory: self.max_applied_log_memory.unwrap_or(DEFAULT_MAX_APPLIED_LOG_MEMORY),
            commit_timeout: self.commit_timeout.unwrap_or(DEFAULT_COMMIT_TIMEOUT),
            follower_probing_enabled: self.follower_probing_enabled.unwrap_or(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::build("node-a".into()).log_dir("/tmp/raftkv-log".into()).validate().unwrap();
        assert_eq!(config.min_election_timeout, DEFAULT_MIN_ELECTION_TIMEOUT);
        assert_eq!(config.heartbeat_timeout, DEFAULT_HEARTBEAT_TIMEOUT);
        assert!(!config.follower_probing_enabled);
    }

    #[test]
    fn rand_election_timeout_in_range() {
        let config = Config::build("node-a".into()).log_dir("/tmp/raftkv-log".into()).validate().unwrap();
        for _ in 0..100 {
            let t = config.new_rand_election_timeout();
            assert!(t >= config.min_election_timeout && t <= config.max_election_timeout);
        }
    }

    #[test]
    fn heartbeat_must_beat_election_timeout() {
        let res = Config::build("node-a".into())
            .log_dir("/tmp/raftkv-log".into())
            .heartbeat_timeout(300)
            .election_timeout_min(300)
            .election_timeout_max(600)
            .validate();
        assert!(matches!(res, Err(ConfigError::InvalidHeartbeatTimeout)));
    }

    #[test]
    fn inverted_election_range_rejected() {
        let res = Config::build("node-a".into())
            .log_dir("/tmp/raftkv-log".into())
            .election_timeout_min(700)
            .election_timeout_max(600)
            .validate();
        assert!(matches!(res, Err(ConfigError::InvalidElectionTimeoutMinMax)));
    }

    #[test]
    fn identity_required() {
        let res = Config::build("".into()).log_dir("/tmp/raftkv-log".into()).validate();
        assert!(matches!(res, Err(ConfigError::MissingIdentity)));
    }
}
