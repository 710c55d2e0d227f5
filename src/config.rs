//! WolfQuorum Configuration
//!
//! Tunables for health probing, maintenance sequencing and logging.
//! A configuration is parsed and validated in a single pass; an invalid
//! combination is rejected at construction time.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main WolfQuorum configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WolfQuorumConfig {
    /// Health probing configuration
    #[serde(default)]
    pub health: HealthConfig,

    /// Maintenance (defragmentation) configuration
    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Health probing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Per-member probe timeout in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

/// Maintenance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// How long a member may take to report Available after defragmentation
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,

    /// Interval between recovery probes in milliseconds
    #[serde(default = "default_recovery_poll_interval_ms")]
    pub recovery_poll_interval_ms: u64,

    /// Members with a smaller database are not defragmented (0 = no minimum)
    #[serde(default)]
    pub min_defrag_bytes: u64,

    /// Members fragmented below this percentage are not defragmented (0 = always)
    #[serde(default)]
    pub max_fragmented_percentage: f64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_probe_timeout_ms() -> u64 {
    5000
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

fn default_recovery_poll_interval_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            recovery_timeout_ms: default_recovery_timeout_ms(),
            recovery_poll_interval_ms: default_recovery_poll_interval_ms(),
            min_defrag_bytes: 0,
            max_fragmented_percentage: 0.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl HealthConfig {
    /// Get probe timeout as Duration
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl MaintenanceConfig {
    /// Get recovery timeout as Duration
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    /// Get recovery poll interval as Duration
    pub fn recovery_poll_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_poll_interval_ms)
    }
}

impl WolfQuorumConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfQuorumConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.health.probe_timeout_ms == 0 {
            return Err(crate::Error::Config("health.probe_timeout_ms must be positive".into()));
        }

        let maintenance = &self.maintenance;
        if maintenance.recovery_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "maintenance.recovery_timeout_ms must be positive".into(),
            ));
        }

        if maintenance.recovery_poll_interval_ms == 0
            || maintenance.recovery_poll_interval_ms > maintenance.recovery_timeout_ms
        {
            return Err(crate::Error::Config(format!(
                "maintenance.recovery_poll_interval_ms must be within 1..={}",
                maintenance.recovery_timeout_ms
            )));
        }

        if !(0.0..=100.0).contains(&maintenance.max_fragmented_percentage) {
            return Err(crate::Error::Config(
                "maintenance.max_fragmented_percentage must be within 0..=100".into(),
            ));
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(crate::Error::Config(format!(
                    "logging.format must be 'pretty' or 'json', got '{}'",
                    other
                )))
            }
        }

        Ok(())
    }

    /// Write the configuration back out as TOML
    pub fn to_file(&self, path: &Path) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[health]
probe_timeout_ms = 2000

[maintenance]
recovery_timeout_ms = 10000
recovery_poll_interval_ms = 250
min_defrag_bytes = 104857600
max_fragmented_percentage = 45.0

[logging]
level = "debug"
format = "json"
"#;

        let config = WolfQuorumConfig::from_str(toml).unwrap();
        assert_eq!(config.health.probe_timeout(), Duration::from_secs(2));
        assert_eq!(config.maintenance.recovery_poll_interval(), Duration::from_millis(250));
        assert_eq!(config.maintenance.min_defrag_bytes, 100 * 1024 * 1024);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_defaults_from_empty_file() {
        let config = WolfQuorumConfig::from_str("").unwrap();
        assert_eq!(config.health.probe_timeout_ms, 5000);
        assert_eq!(config.maintenance.recovery_timeout_ms, 30_000);
        assert_eq!(config.maintenance.max_fragmented_percentage, 0.0);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_rejects_invalid_combinations() {
        let poll_exceeds_timeout = r#"
[maintenance]
recovery_timeout_ms = 100
recovery_poll_interval_ms = 500
"#;
        assert!(matches!(
            WolfQuorumConfig::from_str(poll_exceeds_timeout),
            Err(crate::Error::Config(_))
        ));

        let bad_percentage = "[maintenance]\nmax_fragmented_percentage = 140.0\n";
        assert!(WolfQuorumConfig::from_str(bad_percentage).is_err());

        let bad_format = "[logging]\nformat = \"xml\"\n";
        assert!(WolfQuorumConfig::from_str(bad_format).is_err());

        assert!(matches!(
            WolfQuorumConfig::from_str("[health]\nprobe_timeout_ms = \"fast\"\n"),
            Err(crate::Error::ConfigParse(_))
        ));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wolfquorum.toml");

        let mut config = WolfQuorumConfig::default();
        config.health.probe_timeout_ms = 1500;
        config.to_file(&path).unwrap();

        let loaded = WolfQuorumConfig::from_file(&path).unwrap();
        assert_eq!(loaded.health.probe_timeout_ms, 1500);
    }
}
