//! Construction-time options.
//!
//! Every option has a default, so an empty configuration file connects to a
//! local server without a password:
//!
//! ```toml
//! address = "localhost:6600"
//! password = "hunter2"
//! connect_timeout = 5.0
//! healthcheck_interval = 30.0
//! reconnect_interval = 1.0
//! binary_limit = 1048576
//! watch_queue = 10
//! subsystems = ["player", "mixer"]
//! ```
//!
//! Durations are given in (fractional) seconds.

use std::{fs, path::Path, time::Duration};

use serde::{de::Error as _, Deserialize, Deserializer};
use veil::Redact;

use crate::error::{Error, Result};

#[derive(Redact, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// `host:port`, or the path of a local socket.
    pub address: String,

    /// Shared password, sent right after connecting.
    #[redact]
    pub password: Option<String>,

    /// Bound on dialing and on the greeting exchange.
    #[serde(deserialize_with = "seconds")]
    pub connect_timeout: Duration,

    /// Interval of the keep-alive `ping`; none disables it.
    #[serde(deserialize_with = "optional_seconds")]
    pub healthcheck_interval: Option<Duration>,

    /// Pause between reconnection attempts.
    #[serde(deserialize_with = "seconds")]
    pub reconnect_interval: Duration,

    /// Maximum chunk size of picture transfers, sent as `binarylimit`.
    pub binary_limit: Option<usize>,

    /// Capacity of the watcher's event queue.
    pub watch_queue: usize,

    /// Subsystems the watcher listens to; empty means all.
    pub subsystems: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: "localhost:6600".to_owned(),
            password: None,
            connect_timeout: Duration::from_secs(5),
            healthcheck_interval: None,
            reconnect_interval: Duration::from_secs(1),
            binary_limit: None,
            watch_queue: 10,
            subsystems: Vec::new(),
        }
    }
}

impl Config {
    /// Configuration files are expected to be tiny.
    const MAX_FILE_SIZE: u64 = 16 * 1024;

    #[must_use]
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Loads a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is larger than 16 KiB,
    /// or does not describe a valid configuration.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Prevent out-of-memory condition: configuration should be small.
        let file_size = fs::metadata(path)?.len();
        if file_size > Self::MAX_FILE_SIZE {
            return Err(Error::invalid_argument(format!(
                "{} is too large ({file_size} bytes)",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Checks invariants serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` on an empty address, a zero reconnect
    /// interval or a zero-sized event queue.
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(Error::invalid_argument("address is empty"));
        }
        if self.reconnect_interval.is_zero() {
            return Err(Error::invalid_argument("reconnect interval is zero"));
        }
        if self.watch_queue == 0 {
            return Err(Error::invalid_argument("watch queue size is zero"));
        }
        if self.healthcheck_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(Error::invalid_argument("health check interval is zero"));
        }
        Ok(())
    }
}

fn seconds<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
}

fn optional_seconds<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<f64>::deserialize(deserializer)?
        .map(|secs| Duration::try_from_secs_f64(secs).map_err(D::Error::custom))
        .transpose()
}
