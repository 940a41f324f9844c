// ABOUTME: Engine settings loaded from environment variables with validated defaults
// ABOUTME: Covers template location, port range, lifecycle timeouts and sandbox limits

use crate::constants::*;
use crate::env::{env_or_default, positive_env_or_default, string_env_or_default};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid port range: {min}-{max}")]
    InvalidPortRange { min: u16, max: u16 },

    #[error("Invalid setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

pub const DEFAULT_TEMPLATE_DIR: &str = "./templates";
pub const DEFAULT_EXTERNAL_ADDRESS: &str = "localhost";
pub const DEFAULT_PORT_RANGE_MIN: u16 = 20000;
pub const DEFAULT_PORT_RANGE_MAX: u16 = 30000;
pub const DEFAULT_BUILD_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_MAX_IMPORT_DEPTH: usize = 8;
pub const DEFAULT_SCRIPT_MAX_OPERATIONS: u64 = 1_000_000;
pub const DEFAULT_PULL_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 2;

/// Settings shared by the template engine, the port pool and the runtime
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineSettings {
    pub template_dir: PathBuf,
    /// Host name or address under which exposed container ports are reachable
    pub external_address: String,
    pub port_range_min: u16,
    pub port_range_max: u16,
    /// Upper bound on the whole construction of one environment
    pub build_timeout_secs: u64,
    /// Zero disables the keep-alive watchdog
    pub default_keep_alive_secs: u64,
    pub max_import_depth: usize,
    pub script_max_operations: u64,
    pub pull_timeout_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            template_dir: PathBuf::from(DEFAULT_TEMPLATE_DIR),
            external_address: DEFAULT_EXTERNAL_ADDRESS.to_string(),
            port_range_min: DEFAULT_PORT_RANGE_MIN,
            port_range_max: DEFAULT_PORT_RANGE_MAX,
            build_timeout_secs: DEFAULT_BUILD_TIMEOUT_SECS,
            default_keep_alive_secs: 0,
            max_import_depth: DEFAULT_MAX_IMPORT_DEPTH,
            script_max_operations: DEFAULT_SCRIPT_MAX_OPERATIONS,
            pull_timeout_secs: DEFAULT_PULL_TIMEOUT_SECS,
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
        }
    }
}

impl EngineSettings {
    /// Build settings from `ENVFORGE_*` environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let settings = Self {
            template_dir: PathBuf::from(string_env_or_default(
                ENVFORGE_TEMPLATE_DIR,
                DEFAULT_TEMPLATE_DIR,
            )),
            external_address: string_env_or_default(
                ENVFORGE_EXTERNAL_ADDRESS,
                DEFAULT_EXTERNAL_ADDRESS,
            ),
            port_range_min: positive_env_or_default(ENVFORGE_PORT_RANGE_MIN, DEFAULT_PORT_RANGE_MIN),
            port_range_max: positive_env_or_default(ENVFORGE_PORT_RANGE_MAX, DEFAULT_PORT_RANGE_MAX),
            build_timeout_secs: positive_env_or_default(ENVFORGE_BUILD_TIMEOUT_SECS, DEFAULT_BUILD_TIMEOUT_SECS),
            default_keep_alive_secs: env_or_default(ENVFORGE_DEFAULT_KEEP_ALIVE_SECS, 0, |_| true),
            max_import_depth: positive_env_or_default(ENVFORGE_MAX_IMPORT_DEPTH, DEFAULT_MAX_IMPORT_DEPTH),
            script_max_operations: positive_env_or_default(ENVFORGE_SCRIPT_MAX_OPERATIONS, DEFAULT_SCRIPT_MAX_OPERATIONS),
            pull_timeout_secs: positive_env_or_default(ENVFORGE_PULL_TIMEOUT_SECS, DEFAULT_PULL_TIMEOUT_SECS),
            probe_timeout_secs: positive_env_or_default(ENVFORGE_PROBE_TIMEOUT_SECS, DEFAULT_PROBE_TIMEOUT_SECS),
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port_range_min == 0 || self.port_range_min >= self.port_range_max {
            return Err(ConfigError::InvalidPortRange {
                min: self.port_range_min,
                max: self.port_range_max,
            });
        }

        if self.external_address.trim().is_empty() {
            return Err(ConfigError::InvalidSetting {
                name: "external_address",
                reason: "must not be empty".to_string(),
            });
        }

        if self.build_timeout_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "build_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.max_import_depth == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "max_import_depth",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn default_keep_alive(&self) -> Option<Duration> {
        (self.default_keep_alive_secs > 0)
            .then(|| Duration::from_secs(self.default_keep_alive_secs))
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(EngineSettings::default().validate().is_ok());
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let settings = EngineSettings {
            port_range_min: 30000,
            port_range_max: 20000,
            ..Default::default()
        };

        assert_eq!(
            settings.validate(),
            Err(ConfigError::InvalidPortRange {
                min: 30000,
                max: 20000
            })
        );
    }

    #[test]
    fn test_keep_alive_zero_is_disabled() {
        let settings = EngineSettings::default();
        assert!(settings.default_keep_alive().is_none());

        let settings = EngineSettings {
            default_keep_alive_secs: 30,
            ..Default::default()
        };
        assert_eq!(settings.default_keep_alive(), Some(Duration::from_secs(30)));
    }
}
