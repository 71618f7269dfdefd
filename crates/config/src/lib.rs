#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Configuration for the scheduling core. Small on purpose: the scheduler
//! has no topology to describe (pipelines are created lazily from
//! submissions), only a handful of runtime tunables.

use std::{fs::File, io::BufReader, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use validator::Validate;

/// Errors for the config crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The config file could not be read or parsed.
    #[error("invalid configuration file `{file}` - {message}")]
    InvalidConfig {
        /// The path to the config file.
        file: String,
        /// The error message.
        message: String,
    },

    /// The config file was read but failed validation.
    #[error("configuration validation failed for `{file}` - {message}")]
    ValidationFailed {
        /// The path to the config file.
        file: String,
        /// The error message.
        message: String,
    },
}

/// Runtime tunables for the scheduling core.
#[derive(Serialize, Deserialize, Debug, Clone, Validate)]
pub struct SchedulerConfig {
    /// Upper bound on how long `Scheduler::stop` waits for worker processes
    /// to close before returning anyway. Worker close is best-effort and
    /// authoritative regardless: this only bounds how long shutdown can
    /// block.
    #[serde(default = "default_shutdown_grace_ms")]
    #[validate(range(min = 0, max = 600_000))]
    pub shutdown_grace_ms: u64,

    /// Priority assigned to a submission when the caller does not specify
    /// one.
    #[serde(default)]
    pub default_priority: i64,
}

fn default_shutdown_grace_ms() -> u64 {
    30_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: default_shutdown_grace_ms(),
            default_priority: 0,
        }
    }
}

impl SchedulerConfig {
    /// Loads and validates a configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(config_file_path: P) -> Result<Self, Error> {
        let file_name = config_file_path.as_ref().display().to_string();
        debug!(file = %file_name, "loading scheduler configuration");

        let file = File::open(config_file_path).map_err(|err| Error::InvalidConfig {
            file: file_name.clone(),
            message: err.to_string(),
        })?;
        let config: SchedulerConfig = serde_yaml::from_reader(BufReader::new(file)).map_err(|err| Error::InvalidConfig {
            file: file_name.clone(),
            message: err.to_string(),
        })?;

        config.validate().map_err(|err| Error::ValidationFailed {
            file: file_name,
            message: err.to_string(),
        })?;

        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.shutdown_grace_ms, 30_000);
    }

    #[test]
    fn deserializes_partial_yaml_with_defaults() {
        let yaml = "---\ndefault_priority: 5\n";
        let config: SchedulerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.default_priority, 5);
        assert_eq!(config.shutdown_grace_ms, 30_000);
    }

    #[test]
    fn out_of_range_grace_period_fails_validation() {
        let config = SchedulerConfig {
            shutdown_grace_ms: 1_000_000,
            default_priority: 0,
        };
        assert!(config.validate().is_err());
    }
}
