//! Runtime configuration for the Raft side of the fabric.

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

/// Default heartbeat interval in milliseconds.
const DEFAULT_HEARTBEAT_INTERVAL: u64 = 100;
/// Default election timeout window in milliseconds.
const DEFAULT_ELECTION_TIMEOUT_MIN: u64 = 300;
const DEFAULT_ELECTION_TIMEOUT_MAX: u64 = 600;
/// Default maximum number of entries per append message.
const DEFAULT_MESSAGE_SIZE: u64 = 64;

/// The runtime configuration of a Raft participant.
///
/// Build instances via `Config::build(..).validate()`:
///
/// ```
/// use fabric::Config;
///
/// let config = Config::build("raft".into())
///     .heartbeat_interval(150)
///     .election_timeout(450, 900)
///     .validate()
///     .expect("config is invalid");
/// assert_eq!(config.message_size, 64);
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The service name under which remote Raft endpoints are resolved.
    pub service_name: String,
    /// The period of leader heartbeats, in milliseconds.
    pub heartbeat_interval: u64,
    /// The minimum election timeout, in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout, in milliseconds.
    pub election_timeout_max: u64,
    /// The maximum number of log entries shipped per append message.
    pub message_size: u64,
}

impl Config {
    /// Start the builder process with the given remote service name.
    pub fn build(service_name: String) -> ConfigBuilder {
        ConfigBuilder {
            service_name,
            heartbeat_interval: None,
            election_timeout_min: None,
            election_timeout_max: None,
            message_size: None,
        }
    }

    /// Generate a new random election timeout within the configured window.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }
}

/// A configuration builder validated into a [`Config`].
pub struct ConfigBuilder {
    service_name: String,
    heartbeat_interval: Option<u64>,
    election_timeout_min: Option<u64>,
    election_timeout_max: Option<u64>,
    message_size: Option<u64>,
}

impl ConfigBuilder {
    /// Set the heartbeat interval, in milliseconds.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the election timeout window, in milliseconds.
    pub fn election_timeout(mut self, min: u64, max: u64) -> Self {
        self.election_timeout_min = Some(min);
        self.election_timeout_max = Some(max);
        self
    }

    /// Set the maximum number of entries per append message.
    pub fn message_size(mut self, val: u64) -> Self {
        self.message_size = Some(val);
        self
    }

    /// Validate the state of the builder and produce a new `Config`.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        let election_timeout_min = self.election_timeout_min.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MIN);
        let election_timeout_max = self.election_timeout_max.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MAX);
        let message_size = self.message_size.unwrap_or(DEFAULT_MESSAGE_SIZE);

        if election_timeout_min <= heartbeat_interval {
            return Err(ConfigError::ElectionTimeoutTooSmall);
        }
        if election_timeout_max <= election_timeout_min {
            return Err(ConfigError::InvalidElectionTimeoutRange);
        }
        if message_size == 0 {
            return Err(ConfigError::InvalidMessageSize);
        }

        Ok(Config {
            service_name: self.service_name,
            heartbeat_interval,
            election_timeout_min,
            election_timeout_max,
            message_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::build("raft".into()).validate().unwrap();
        assert_eq!(config.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(config.message_size, DEFAULT_MESSAGE_SIZE);
    }

    #[test]
    fn election_timeout_must_exceed_heartbeat() {
        let res = Config::build("raft".into())
            .heartbeat_interval(500)
            .election_timeout(400, 800)
            .validate();
        assert!(matches!(res, Err(ConfigError::ElectionTimeoutTooSmall)));
    }

    #[test]
    fn election_timeout_window_must_be_ordered() {
        let res = Config::build("raft".into()).election_timeout(500, 500).validate();
        assert!(matches!(res, Err(ConfigError::InvalidElectionTimeoutRange)));
    }

    #[test]
    fn message_size_must_be_positive() {
        let res = Config::build("raft".into()).message_size(0).validate();
        assert!(matches!(res, Err(ConfigError::InvalidMessageSize)));
    }

    #[test]
    fn random_election_timeouts_stay_in_window() {
        let config = Config::build("raft".into()).validate().unwrap();
        for _ in 0..64 {
            let t = config.new_rand_election_timeout();
            assert!(t >= config.election_timeout_min && t < config.election_timeout_max);
        }
    }
}
